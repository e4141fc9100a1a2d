use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::job::Job;
use crate::error::PipelineError;

/// The states of the tailoring pipeline, in pipeline order.
///
/// Each job flows through:
/// INITIALIZED → GAP_ANALYSIS → [GAP_ANALYSIS_REVIEW] → INTERROGATION →
/// [INTERROGATION_REVIEW] → DIFFERENTIATION → TAILORING → ATS_OPTIMIZATION →
/// AUDITING → EXECUTIVE_SYNTHESIS → COMPLETED
///
/// `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Initialized,
    GapAnalysis,
    GapAnalysisReview,
    Interrogation,
    InterrogationReview,
    Differentiation,
    Tailoring,
    AtsOptimization,
    Auditing,
    ExecutiveSynthesis,
    Completed,
    Failed,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 12] = [
        WorkflowState::Initialized,
        WorkflowState::GapAnalysis,
        WorkflowState::GapAnalysisReview,
        WorkflowState::Interrogation,
        WorkflowState::InterrogationReview,
        WorkflowState::Differentiation,
        WorkflowState::Tailoring,
        WorkflowState::AtsOptimization,
        WorkflowState::Auditing,
        WorkflowState::ExecutiveSynthesis,
        WorkflowState::Completed,
        WorkflowState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Initialized => "initialized",
            WorkflowState::GapAnalysis => "gap_analysis",
            WorkflowState::GapAnalysisReview => "gap_analysis_review",
            WorkflowState::Interrogation => "interrogation",
            WorkflowState::InterrogationReview => "interrogation_review",
            WorkflowState::Differentiation => "differentiation",
            WorkflowState::Tailoring => "tailoring",
            WorkflowState::AtsOptimization => "ats_optimization",
            WorkflowState::Auditing => "auditing",
            WorkflowState::ExecutiveSynthesis => "executive_synthesis",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
        }
    }

    /// The successor on the happy path. Terminal states have none.
    pub fn next(&self) -> Option<WorkflowState> {
        match self {
            WorkflowState::Initialized => Some(WorkflowState::GapAnalysis),
            WorkflowState::GapAnalysis => Some(WorkflowState::GapAnalysisReview),
            WorkflowState::GapAnalysisReview => Some(WorkflowState::Interrogation),
            WorkflowState::Interrogation => Some(WorkflowState::InterrogationReview),
            WorkflowState::InterrogationReview => Some(WorkflowState::Differentiation),
            WorkflowState::Differentiation => Some(WorkflowState::Tailoring),
            WorkflowState::Tailoring => Some(WorkflowState::AtsOptimization),
            WorkflowState::AtsOptimization => Some(WorkflowState::Auditing),
            WorkflowState::Auditing => Some(WorkflowState::ExecutiveSynthesis),
            WorkflowState::ExecutiveSynthesis => Some(WorkflowState::Completed),
            WorkflowState::Completed | WorkflowState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }

    /// HITL suspension points: the engine parks here and waits for `resume`.
    pub fn is_review(&self) -> bool {
        matches!(
            self,
            WorkflowState::GapAnalysisReview | WorkflowState::InterrogationReview
        )
    }

    /// Coarse progress percentage reported to status queries and subscribers.
    pub fn progress(&self) -> u8 {
        match self {
            WorkflowState::Initialized => 0,
            WorkflowState::GapAnalysis => 10,
            WorkflowState::GapAnalysisReview => 20,
            WorkflowState::Interrogation => 30,
            WorkflowState::InterrogationReview => 40,
            WorkflowState::Differentiation => 50,
            WorkflowState::Tailoring => 60,
            WorkflowState::AtsOptimization => 70,
            WorkflowState::Auditing => 80,
            WorkflowState::ExecutiveSynthesis => 90,
            WorkflowState::Completed | WorkflowState::Failed => 100,
        }
    }

    /// Whether `self → to` is an edge of the pipeline graph.
    ///
    /// Besides the happy-path successor and `Failed`, the audit correction
    /// loop may step back from `Auditing` to `Tailoring` and return from
    /// `Tailoring` straight to `Auditing`.
    pub fn can_transition_to(&self, to: WorkflowState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == WorkflowState::Failed || self.next() == Some(to) {
            return true;
        }
        matches!(
            (self, to),
            (WorkflowState::Auditing, WorkflowState::Tailoring)
                | (WorkflowState::Tailoring, WorkflowState::Auditing)
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        WorkflowState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| PipelineError::InvalidInput(format!("unknown workflow state: {s}")))
    }
}

/// Applies validated transitions to a `Job`.
pub struct StateMachine;

impl StateMachine {
    /// Move `job` to `to`, recording the state it leaves.
    ///
    /// Rejects edges outside the pipeline graph and any move out of a
    /// terminal state, leaving the job untouched in both cases.
    pub fn transition(job: &mut Job, to: WorkflowState) -> Result<(), PipelineError> {
        let from = job.state;
        if !from.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition { from, to });
        }

        let now = Utc::now();
        job.state_history.push(from);
        job.state = to;
        job.updated_at = now;
        if from == WorkflowState::Initialized {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.completed_at = Some(now);
        }
        Ok(())
    }

    /// Advance along the happy path.
    pub fn advance(job: &mut Job) -> Result<WorkflowState, PipelineError> {
        let to = job.state.next().ok_or(PipelineError::InvalidTransition {
            from: job.state,
            to: job.state,
        })?;
        Self::transition(job, to)?;
        Ok(to)
    }

    /// Move to `Failed` with a human-readable reason.
    pub fn fail(job: &mut Job, message: impl Into<String>) -> Result<(), PipelineError> {
        Self::transition(job, WorkflowState::Failed)?;
        job.success = false;
        job.error_message = Some(message.into());
        Ok(())
    }
}
