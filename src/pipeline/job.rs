use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::{Documents, Stage, StageOutput};
use super::state::WorkflowState;
use crate::audit::{AuditIssue, AuditReport};
use crate::error::PipelineError;

/// The immutable inputs a job is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub job_description: String,
    pub baseline_document: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl JobInput {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.job_description.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "job description must not be empty".into(),
            ));
        }
        if self.baseline_document.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "baseline document must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// The validated output of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub produced_at: DateTime<Utc>,
    pub confidence: f64,
    pub output: StageOutput,
}

impl StageResult {
    pub fn new(output: StageOutput, confidence: f64) -> Self {
        Self {
            stage: output.stage(),
            produced_at: Utc::now(),
            confidence,
            output,
        }
    }
}

/// What a reviewer supplied when releasing a HITL gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewInput {
    pub approved: bool,
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Sent to the tailoring stage when the audit asks for corrections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRequest {
    pub documents: Documents,
    pub issues: Vec<AuditIssue>,
}

/// Everything a stage invocation gets to see.
#[derive(Debug, Clone, Serialize)]
pub struct StageContext {
    pub input: JobInput,
    pub prior_results: BTreeMap<Stage, StageResult>,
    pub reviews: BTreeMap<WorkflowState, ReviewInput>,
    /// Documents that went through the audit, once it has run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_documents: Option<Documents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<RevisionRequest>,
}

impl StageContext {
    pub fn with_revision(mut self, revision: RevisionRequest) -> Self {
        self.revision = Some(revision);
        self
    }
}

/// A single tailoring run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub state: WorkflowState,
    pub state_history: Vec<WorkflowState>,
    pub input: JobInput,
    pub intermediate_results: BTreeMap<Stage, StageResult>,
    #[serde(default)]
    pub reviews: BTreeMap<WorkflowState, ReviewInput>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub success: bool,
    pub final_documents: Option<Documents>,
    pub audit_report: Option<AuditReport>,
    pub audit_failed: bool,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(input: JobInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            state: WorkflowState::Initialized,
            state_history: Vec::new(),
            input,
            intermediate_results: BTreeMap::new(),
            reviews: BTreeMap::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            success: false,
            final_documents: None,
            audit_report: None,
            audit_failed: false,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn progress(&self) -> u8 {
        self.state.progress()
    }

    pub fn result(&self, stage: Stage) -> Option<&StageResult> {
        self.intermediate_results.get(&stage)
    }

    fn ensure_mutable(&self) -> Result<(), PipelineError> {
        if self.is_terminal() {
            return Err(PipelineError::InvalidInput(format!(
                "job {} is {} and can no longer change",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Store the first successful result for a stage. Existing keys are never
    /// overwritten here; see [`Job::replace_regenerated`].
    pub fn record_result(&mut self, result: StageResult) -> Result<(), PipelineError> {
        self.ensure_mutable()?;
        if self.intermediate_results.contains_key(&result.stage) {
            return Err(PipelineError::InvalidInput(format!(
                "result for stage {} already recorded",
                result.stage
            )));
        }
        self.updated_at = Utc::now();
        self.intermediate_results.insert(result.stage, result);
        Ok(())
    }

    /// Overwrite the tailoring result with an audit-driven regeneration.
    pub fn replace_regenerated(&mut self, result: StageResult) -> Result<(), PipelineError> {
        self.ensure_mutable()?;
        if result.stage != Stage::Tailoring {
            return Err(PipelineError::InvalidInput(format!(
                "only tailoring output may be regenerated, got {}",
                result.stage
            )));
        }
        self.updated_at = Utc::now();
        self.intermediate_results.insert(Stage::Tailoring, result);
        Ok(())
    }

    /// The most refined documents produced so far. Audited documents win
    /// over stage outputs.
    pub fn latest_documents(&self) -> Option<&Documents> {
        self.final_documents.as_ref().or_else(|| {
            [Stage::AtsOptimization, Stage::Tailoring]
                .iter()
                .find_map(|stage| self.result(*stage).and_then(|r| r.output.documents()))
        })
    }

    /// Snapshot of everything a stage invocation may read.
    pub fn context(&self) -> StageContext {
        StageContext {
            input: self.input.clone(),
            prior_results: self.intermediate_results.clone(),
            reviews: self.reviews.clone(),
            final_documents: self.final_documents.clone(),
            revision: None,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from_job(self)
    }
}

/// Read-only view handed to status queries and late subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub state: WorkflowState,
    pub progress: u8,
    pub state_transitions: Vec<WorkflowState>,
    pub intermediate_results: BTreeMap<Stage, StageResult>,
    pub success: bool,
    pub final_documents: Option<Documents>,
    pub audit_report: Option<AuditReport>,
    pub audit_failed: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl JobSnapshot {
    pub fn from_job(job: &Job) -> Self {
        let mut transitions = job.state_history.clone();
        transitions.push(job.state);
        let duration_ms = match (job.started_at, job.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };

        Self {
            job_id: job.id.clone(),
            state: job.state,
            progress: job.progress(),
            state_transitions: transitions,
            intermediate_results: job.intermediate_results.clone(),
            success: job.success,
            final_documents: job.final_documents.clone(),
            audit_report: job.audit_report.clone(),
            audit_failed: job.audit_failed,
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            completed_at: job.completed_at,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::{Tailoring, AtsOptimization, Differentiation};

    fn input() -> JobInput {
        JobInput {
            job_description: "Backend engineer".into(),
            baseline_document: "Built payment systems.".into(),
            sources: vec!["Reference letter".into()],
        }
    }

    fn tailoring(resume: &str) -> StageResult {
        StageResult::new(
            StageOutput::Tailoring(Tailoring {
                documents: Documents {
                    resume: resume.into(),
                    cover_letter: None,
                },
                changes: Vec::new(),
            }),
            0.9,
        )
    }

    #[test]
    fn job_creation_defaults() {
        let job = Job::new(input());
        assert_eq!(job.state, WorkflowState::Initialized);
        assert!(job.state_history.is_empty());
        assert!(job.intermediate_results.is_empty());
        assert!(!job.success);
        assert_eq!(job.progress(), 0);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn input_validation() {
        assert!(input().validate().is_ok());
        let mut blank = input();
        blank.baseline_document = "   ".into();
        assert!(matches!(
            blank.validate(),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn results_are_never_silently_overwritten() {
        let mut job = Job::new(input());
        job.record_result(tailoring("v1")).unwrap();
        assert!(job.record_result(tailoring("v2")).is_err());
        assert_eq!(
            job.latest_documents().unwrap().resume,
            "v1"
        );

        job.replace_regenerated(tailoring("v2")).unwrap();
        assert_eq!(job.latest_documents().unwrap().resume, "v2");
    }

    #[test]
    fn terminal_jobs_reject_regenerated_output() {
        let mut job = Job::new(input());
        job.record_result(tailoring("v1")).unwrap();
        crate::pipeline::StateMachine::fail(&mut job, "stopped").unwrap();

        assert!(matches!(
            job.replace_regenerated(tailoring("v2")),
            Err(PipelineError::InvalidInput(_))
        ));
        assert_eq!(job.latest_documents().unwrap().resume, "v1");
    }

    #[test]
    fn only_tailoring_can_be_regenerated() {
        let mut job = Job::new(input());
        let diff = StageResult::new(
            StageOutput::Differentiation(Differentiation {
                positioning_statement: "p".into(),
                differentiators: vec!["d".into()],
            }),
            0.5,
        );
        assert!(job.replace_regenerated(diff).is_err());
    }

    #[test]
    fn latest_documents_prefers_ats_output() {
        let mut job = Job::new(input());
        job.record_result(tailoring("tailored")).unwrap();
        job.record_result(StageResult::new(
            StageOutput::AtsOptimization(AtsOptimization {
                documents: Documents {
                    resume: "optimized".into(),
                    cover_letter: None,
                },
                keyword_coverage: 90.0,
                missing_keywords: Vec::new(),
            }),
            0.8,
        ))
        .unwrap();
        assert_eq!(job.latest_documents().unwrap().resume, "optimized");
    }

    #[test]
    fn results_keep_pipeline_order() {
        let mut job = Job::new(input());
        job.record_result(tailoring("t")).unwrap();
        job.record_result(StageResult::new(
            StageOutput::Differentiation(Differentiation {
                positioning_statement: "p".into(),
                differentiators: vec!["d".into()],
            }),
            0.5,
        ))
        .unwrap();
        let keys: Vec<_> = job.intermediate_results.keys().copied().collect();
        assert_eq!(keys, vec![Stage::Differentiation, Stage::Tailoring]);
    }

    #[test]
    fn snapshot_includes_current_state() {
        let job = Job::new(input());
        let snapshot = job.snapshot();
        assert_eq!(snapshot.job_id, job.id);
        assert_eq!(snapshot.state_transitions, vec![WorkflowState::Initialized]);
        assert_eq!(snapshot.duration_ms, None);
    }

    #[test]
    fn job_serialization_roundtrip() {
        let mut job = Job::new(input());
        job.record_result(tailoring("persist me")).unwrap();
        let json = serde_json::to_string(&job).unwrap();
        let restored: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, job.id);
        assert_eq!(restored.intermediate_results, job.intermediate_results);
        assert_eq!(restored.state, WorkflowState::Initialized);
    }
}
