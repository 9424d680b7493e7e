//! Run context and evidence journal
//!
//! All mutable run-wide state lives in one [`RunContext`] passed by reference
//! to every stage. The journal is append-only and hash-chained: each event
//! commits to its predecessor, so an edited or dropped entry breaks
//! [`EvidenceJournal::verify_integrity`].

use crate::config::RunConfig;
use crate::types::RunId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Journal event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the journal, from zero
    pub sequence: u64,
    /// When it was appended
    pub timestamp: DateTime<Utc>,
    /// Workload name, empty for run-level events
    pub workload: String,
    /// Dotted action name
    pub action: String,
    /// Free-form detail
    pub detail: String,
    /// Hash of the previous event, zero for the first
    #[serde(with = "hex_bytes")]
    pub prev_hash: [u8; 32],
    /// SHA-256 over this event and `prev_hash`
    #[serde(with = "hex_bytes")]
    pub hash: [u8; 32],
}

/// Tampering detected in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("journal integrity violation at event {sequence}")]
pub struct IntegrityViolation {
    /// First event whose hash does not match
    pub sequence: u64,
}

/// Append-only, hash-chained event log
#[derive(Debug, Default)]
pub struct EvidenceJournal {
    inner: Mutex<Vec<Event>>,
}

impl EvidenceJournal {
    /// Append an event and return its sequence number
    pub fn append(&self, workload: &str, action: &str, detail: impl Into<String>) -> u64 {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map_or([0u8; 32], |e| e.hash);
        let mut event = Event {
            sequence: guard.len() as u64,
            timestamp: Utc::now(),
            workload: workload.to_string(),
            action: action.to_string(),
            detail: detail.into(),
            prev_hash,
            hash: [0u8; 32],
        };
        event.hash = compute_hash(&event);
        let seq = event.sequence;
        guard.push(event);
        seq
    }

    /// Snapshot of all events
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().clone()
    }

    /// Events of one workload, in append order
    #[must_use]
    pub fn events_for(&self, workload: &str) -> Vec<Event> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.workload == workload)
            .cloned()
            .collect()
    }

    /// Recompute the chain
    ///
    /// # Errors
    /// [`IntegrityViolation`] at the first broken link
    pub fn verify_integrity(&self) -> Result<(), IntegrityViolation> {
        verify_chain(&self.inner.lock())
    }
}

/// Verify an exported chain of events
///
/// # Errors
/// [`IntegrityViolation`] at the first broken link
pub fn verify_chain(events: &[Event]) -> Result<(), IntegrityViolation> {
    let mut prev = [0u8; 32];
    for e in events {
        if e.prev_hash != prev || e.hash != compute_hash(e) {
            return Err(IntegrityViolation {
                sequence: e.sequence,
            });
        }
        prev = e.hash;
    }
    Ok(())
}

fn compute_hash(event: &Event) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(event.sequence.to_le_bytes());
    hasher.update(event.timestamp.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(event.workload.as_bytes());
    hasher.update([0]);
    hasher.update(event.action.as_bytes());
    hasher.update([0]);
    hasher.update(event.detail.as_bytes());
    hasher.update([0]);
    hasher.update(event.prev_hash);
    hasher.finalize().into()
}

mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let raw = hex::decode(text).map_err(D::Error::custom)?;
        raw.try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes"))
    }
}

/// Run counters
#[derive(Debug, Default)]
pub struct RunCounters {
    /// Sessions submitted
    pub submitted: AtomicUsize,
    /// Sessions that reached verification
    pub recovered: AtomicUsize,
    /// Sessions that failed
    pub failed: AtomicUsize,
    /// Sessions whose cleanup failed
    pub cleanup_failed: AtomicUsize,
    /// Sessions currently between submission and teardown
    pub active: AtomicUsize,
    /// High-water mark of `active`
    pub peak_active: AtomicUsize,
}

impl RunCounters {
    /// A session was submitted
    pub fn enter_active(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    /// A submitted session finished teardown
    pub fn leave_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Current peak
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }
}

/// State owned by one run
#[derive(Debug)]
pub struct RunContext {
    /// Unique id of the run
    pub run_id: RunId,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Validated configuration
    pub config: RunConfig,
    /// No recovery is submitted
    pub dry_run: bool,
    /// Evidence journal
    pub journal: EvidenceJournal,
    /// Live counters
    pub counters: RunCounters,
    warnings: Mutex<Vec<String>>,
}

impl RunContext {
    /// Start a new run
    #[must_use]
    pub fn new(config: RunConfig, dry_run: bool) -> Self {
        Self {
            run_id: RunId::new(),
            started_at: Utc::now(),
            config,
            dry_run,
            journal: EvidenceJournal::default(),
            counters: RunCounters::default(),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Record a run-level event
    pub fn record(&self, action: &str, detail: impl Into<String>) {
        self.journal.append("", action, detail);
    }

    /// Record a workload event
    pub fn record_for(&self, workload: &str, action: &str, detail: impl Into<String>) {
        self.journal.append(workload, action, detail);
    }

    /// Surface a non-fatal warning in the summary
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.warnings.lock().push(message);
    }

    /// Warnings collected so far
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}
