//! Result aggregation and compliance scoring
//!
//! The score is a weighted sum of five components, each on a 0-100 scale.
//! Weights never change between runs so scores stay comparable:
//!
//! | component  | weight |
//! |------------|--------|
//! | coverage   | 25     |
//! | pass rate  | 30     |
//! | RTO        | 20     |
//! | recency    | 15     |
//! | automation | 10     |

use crate::catalog::Discovery;
use crate::context::{Event, RunContext};
use crate::preflight::PreflightReport;
use crate::scheduler::SchedulePlan;
use crate::session::{CleanupRecord, RecoverySession, SessionState, StateChange};
use crate::types::{option_duration_ms, RecoveryStrategy, RunId, VerificationResult};
use crate::verification::all_passed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Weight of workload coverage
pub const WEIGHT_COVERAGE: f64 = 25.0;
/// Weight of the raw test pass rate
pub const WEIGHT_PASS_RATE: f64 = 30.0;
/// Weight of RTO compliance
pub const WEIGHT_RTO: f64 = 20.0;
/// Weight of run recency
pub const WEIGHT_RECENCY: f64 = 15.0;
/// Weight of the automation flag
pub const WEIGHT_AUTOMATION: f64 = 10.0;

/// Recency scores 100 up to this age
pub const RECENCY_FULL_DAYS: f64 = 1.0;
/// Recency reaches 0 at this age
pub const RECENCY_ZERO_DAYS: f64 = 30.0;

/// Raw figures the score is computed from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreInputs {
    /// Workloads in scope
    pub known_workloads: usize,
    /// Workloads that executed at least one test
    pub tested_workloads: usize,
    /// Tests executed
    pub tests_total: usize,
    /// Tests that passed
    pub tests_passed: usize,
    /// `None` when no RTO target is configured
    pub rto: Option<RtoFigures>,
    /// Age of the run's evidence at evaluation time
    pub age_days: f64,
    /// Run was started by a scheduler
    pub automated: bool,
}

/// RTO counts over recovered workloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtoFigures {
    /// Workloads with a measured recovery time
    pub measured: usize,
    /// Of those, recovered within the target
    pub met: usize,
}

/// Weighted 0-100 score with its components
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplianceScore {
    /// Tested workloads over workloads in scope, weight 25
    pub coverage: f64,
    /// Passed tests over executed tests, weight 30
    pub pass_rate: f64,
    /// `None` when no RTO target is configured; contributes 0
    pub rto_compliance: Option<f64>,
    /// Freshness of the evidence, weight 15
    pub recency: f64,
    /// 100 for automated runs, weight 10
    pub automation: f64,
    /// Weighted total, 0-100
    pub overall_score: f64,
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 100.0).min(100.0)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Recency component for evidence `age_days` old
#[must_use]
pub fn recency_score(age_days: f64) -> f64 {
    if age_days <= RECENCY_FULL_DAYS {
        100.0
    } else if age_days >= RECENCY_ZERO_DAYS {
        0.0
    } else {
        100.0 * (RECENCY_ZERO_DAYS - age_days) / (RECENCY_ZERO_DAYS - RECENCY_FULL_DAYS)
    }
}

impl ComplianceScore {
    /// Compute the score
    #[must_use]
    pub fn compute(inputs: &ScoreInputs) -> Self {
        let coverage = percent(inputs.tested_workloads, inputs.known_workloads);
        let pass_rate = percent(inputs.tests_passed, inputs.tests_total);
        let rto_compliance = inputs.rto.map(|r| percent(r.met, r.measured));
        let recency = recency_score(inputs.age_days);
        let automation = if inputs.automated { 100.0 } else { 0.0 };

        let overall = (coverage * WEIGHT_COVERAGE
            + pass_rate * WEIGHT_PASS_RATE
            + rto_compliance.unwrap_or(0.0) * WEIGHT_RTO
            + recency * WEIGHT_RECENCY
            + automation * WEIGHT_AUTOMATION)
            / 100.0;

        Self {
            coverage: round2(coverage),
            pass_rate: round2(pass_rate),
            rto_compliance: rto_compliance.map(round2),
            recency: round2(recency),
            automation,
            overall_score: round2(overall),
        }
    }
}

/// Outcome of one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadReport {
    /// Catalog id
    pub workload_id: String,
    /// Display name
    pub workload_name: String,
    /// Restore point that was recovered
    pub restore_point_id: String,
    /// When that restore point was taken
    pub restore_point_created_at: DateTime<Utc>,
    /// Recovery strategy
    pub strategy: RecoveryStrategy,
    /// Temporary instance name
    pub instance_name: String,
    /// Final session state
    pub state: SessionState,
    /// Reached `Running`
    pub recovered: bool,
    /// Recovered and every executed test passed
    pub passed: bool,
    /// First failure, if any
    pub error: Option<String>,
    /// Tests executed
    pub tests_run: usize,
    /// Tests that passed
    pub tests_passed: usize,
    /// Submission to running, serialized as milliseconds
    #[serde(with = "option_duration_ms")]
    pub recovery_duration: Option<Duration>,
    /// `None` without a configured target or a measured duration
    pub rto_met: Option<bool>,
    /// Teardown outcome
    pub cleanup: Option<CleanupRecord>,
    /// Every state transition
    pub history: Vec<StateChange>,
}

/// Execution group as planned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReport {
    /// Group name
    pub label: String,
    /// Member workload names
    pub workloads: Vec<String>,
}

/// Everything handed to reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique id of the run
    pub run_id: RunId,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Nothing was submitted
    pub dry_run: bool,
    /// Recovery strategy
    pub strategy: RecoveryStrategy,
    /// Preflight passed and every workload passed
    pub overall_success: bool,
    /// Preflight findings
    pub preflight: PreflightReport,
    /// Execution groups in order
    pub groups: Vec<GroupReport>,
    /// Per-workload outcomes
    pub workloads: Vec<WorkloadReport>,
    /// Every executed test
    pub results: Vec<VerificationResult>,
    /// Workloads in scope without a restore point
    pub skipped_workloads: Vec<String>,
    /// Sessions whose cleanup failed
    pub cleanup_failures: usize,
    /// Advisories and skipped items, in order raised
    pub warnings: Vec<String>,
    /// Compliance score at completion
    pub score: ComplianceScore,
    /// Figures behind `score`, for re-scoring later
    pub score_inputs: ScoreInputs,
    /// Evidence journal
    pub journal: Vec<Event>,
    /// The journal's hash chain verified
    pub journal_intact: bool,
}

impl RunSummary {
    /// Report for one workload
    #[must_use]
    pub fn workload(&self, name: &str) -> Option<&WorkloadReport> {
        self.workloads.iter().find(|w| w.workload_name == name)
    }

    /// Results of one workload, in execution order
    #[must_use]
    pub fn results_for(&self, name: &str) -> Vec<&VerificationResult> {
        self.results.iter().filter(|r| r.workload_name == name).collect()
    }

    /// Recompute the score as of `now`, e.g. when reporting on an old run
    #[must_use]
    pub fn score_at(&self, now: DateTime<Utc>) -> ComplianceScore {
        ComplianceScore::compute(&ScoreInputs {
            age_days: age_days(self.finished_at, now),
            ..self.score_inputs
        })
    }
}

fn age_days(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    ((now - then).num_seconds().max(0) as f64) / 86_400.0
}

/// Everything aggregation consumes
#[derive(Debug)]
pub struct AggregateInput<'a> {
    /// Run context
    pub ctx: &'a RunContext,
    /// Discovery outcome
    pub discovery: &'a Discovery,
    /// Preflight report
    pub preflight: PreflightReport,
    /// Execution plan
    pub plan: &'a SchedulePlan,
    /// Every session, finished
    pub sessions: Vec<RecoverySession>,
    /// Every verification result
    pub results: Vec<VerificationResult>,
}

/// Roll everything up into a [`RunSummary`]
#[must_use]
pub fn aggregate(input: AggregateInput<'_>) -> RunSummary {
    let AggregateInput {
        ctx,
        discovery,
        preflight,
        plan,
        sessions,
        results,
    } = input;
    let config = &ctx.config;
    let rto_target = config.rto_target();

    let workloads: Vec<WorkloadReport> = sessions
        .iter()
        .map(|s| {
            let own: Vec<VerificationResult> = results
                .iter()
                .filter(|r| r.workload_id == s.restore_point.workload.id)
                .cloned()
                .collect();
            let recovered = s.recovered();
            let recovery_duration = s.recovery_duration();
            WorkloadReport {
                workload_id: s.restore_point.workload.id.clone(),
                workload_name: s.workload_name().to_string(),
                restore_point_id: s.restore_point.id.clone(),
                restore_point_created_at: s.restore_point.created_at,
                strategy: s.strategy,
                instance_name: s.instance_name.clone(),
                state: s.state,
                recovered,
                passed: recovered && all_passed(&own),
                error: s.error.clone(),
                tests_run: own.len(),
                tests_passed: own.iter().filter(|r| r.passed).count(),
                recovery_duration,
                rto_met: rto_target.zip(recovery_duration).map(|(t, d)| d <= t),
                cleanup: s.cleanup.clone(),
                history: s.history.clone(),
            }
        })
        .collect();

    let inputs = ScoreInputs {
        known_workloads: discovery.known_workloads,
        tested_workloads: workloads.iter().filter(|w| w.tests_run > 0).count(),
        tests_total: results.len(),
        tests_passed: results.iter().filter(|r| r.passed).count(),
        rto: rto_target.map(|_| RtoFigures {
            measured: workloads.iter().filter(|w| w.rto_met.is_some()).count(),
            met: workloads.iter().filter(|w| w.rto_met == Some(true)).count(),
        }),
        age_days: 0.0,
        automated: config.automated,
    };
    let score = ComplianceScore::compute(&inputs);

    let cleanup_failures = workloads
        .iter()
        .filter(|w| w.state == SessionState::CleanupFailed)
        .count();
    let overall_success = if ctx.dry_run {
        preflight.passed()
    } else {
        !workloads.is_empty() && workloads.iter().all(|w| w.passed)
    };

    let mut warnings = plan.warnings.clone();
    warnings.extend(ctx.warnings());
    warnings.dedup();
    if cleanup_failures > 0 {
        warnings.push(format!(
            "{cleanup_failures} workload(s) failed cleanup; check for leftover instances"
        ));
    }

    ctx.record(
        "run.finished",
        format!(
            "success={overall_success} workloads={} score={}",
            workloads.len(),
            score.overall_score
        ),
    );
    let journal = ctx.journal.events();
    let journal_intact = ctx.journal.verify_integrity().is_ok();

    RunSummary {
        run_id: ctx.run_id,
        started_at: ctx.started_at,
        finished_at: Utc::now(),
        dry_run: ctx.dry_run,
        strategy: config.strategy,
        overall_success,
        preflight,
        groups: plan
            .groups
            .iter()
            .map(|g| GroupReport {
                label: g.label.clone(),
                workloads: g.workload_names().into_iter().map(String::from).collect(),
            })
            .collect(),
        workloads,
        results,
        skipped_workloads: discovery.skipped.clone(),
        cleanup_failures,
        warnings,
        score,
        score_inputs: inputs,
        journal,
        journal_intact,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn inputs() -> ScoreInputs {
        ScoreInputs {
            known_workloads: 4,
            tested_workloads: 3,
            tests_total: 10,
            tests_passed: 8,
            rto: Some(RtoFigures { measured: 3, met: 2 }),
            age_days: 0.0,
            automated: true,
        }
    }

    #[test]
    fn weights_sum_to_one_hundred() {
        let sum = WEIGHT_COVERAGE + WEIGHT_PASS_RATE + WEIGHT_RTO + WEIGHT_RECENCY + WEIGHT_AUTOMATION;
        assert!((sum - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn weighted_score() {
        let score = ComplianceScore::compute(&inputs());
        // 75*0.25 + 80*0.30 + 66.67*0.20 + 100*0.15 + 100*0.10
        assert_eq!(score.coverage, 75.0);
        assert_eq!(score.pass_rate, 80.0);
        assert_eq!(score.rto_compliance, Some(66.67));
        assert_eq!(score.overall_score, 81.08);
    }

    #[test]
    fn unconfigured_rto_scores_zero() {
        let score = ComplianceScore::compute(&ScoreInputs { rto: None, ..inputs() });
        assert_eq!(score.rto_compliance, None);
        assert_eq!(score.overall_score, 67.75);
    }

    #[test]
    fn perfect_run_scores_one_hundred() {
        let score = ComplianceScore::compute(&ScoreInputs {
            known_workloads: 3,
            tested_workloads: 3,
            tests_total: 9,
            tests_passed: 9,
            rto: Some(RtoFigures { measured: 3, met: 3 }),
            age_days: 0.5,
            automated: true,
        });
        assert_eq!(score.overall_score, 100.0);
    }

    #[test]
    fn recency_decays_linearly() {
        assert_eq!(recency_score(0.0), 100.0);
        assert_eq!(recency_score(1.0), 100.0);
        assert_eq!(recency_score(30.0), 0.0);
        assert_eq!(recency_score(90.0), 0.0);
        let mid = recency_score(15.5);
        assert!((mid - 50.0).abs() < 1e-9);
    }

    #[test]
    fn empty_inputs_do_not_divide_by_zero() {
        let score = ComplianceScore::compute(&ScoreInputs {
            known_workloads: 0,
            tested_workloads: 0,
            tests_total: 0,
            tests_passed: 0,
            rto: Some(RtoFigures { measured: 0, met: 0 }),
            age_days: 0.0,
            automated: false,
        });
        assert_eq!(score.overall_score, 15.0);
    }
}
