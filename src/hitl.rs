//! Human-in-the-loop gates.
//!
//! Parking is just a state: the job record sits in a review state in the
//! store and nothing waits on it. Releasing a gate is an explicit
//! [`ResumeRequest`] that must name the gate it targets.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PipelineError;
use crate::pipeline::{Job, ReviewInput, Stage, StageResult, StateMachine, WorkflowState};

/// A reviewer's decision for one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
    /// The review state this decision is meant for.
    pub at: WorkflowState,
    pub approved: bool,
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ResumeRequest {
    pub fn approve(at: WorkflowState) -> Self {
        Self {
            at,
            approved: true,
            answers: BTreeMap::new(),
            notes: None,
        }
    }

    pub fn reject(at: WorkflowState, notes: impl Into<String>) -> Self {
        Self {
            at,
            approved: false,
            answers: BTreeMap::new(),
            notes: Some(notes.into()),
        }
    }

    pub fn with_answers(mut self, answers: BTreeMap<String, String>) -> Self {
        self.answers = answers;
        self
    }
}

/// What releasing a gate did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Advanced to the next state in sequence.
    Advanced(WorkflowState),
    /// The reviewer rejected the artifact; the job failed.
    Rejected,
}

pub struct HitlGate;

impl HitlGate {
    /// The stage whose output a reviewer inspects at `state`.
    pub fn reviewed_stage(state: WorkflowState) -> Option<Stage> {
        match state {
            WorkflowState::GapAnalysisReview => Some(Stage::GapAnalysis),
            WorkflowState::InterrogationReview => Some(Stage::Interrogation),
            _ => None,
        }
    }

    /// The artifact presented to the reviewer while the job is parked.
    pub fn artifact(job: &Job) -> Option<&StageResult> {
        Self::reviewed_stage(job.state).and_then(|stage| job.result(stage))
    }

    /// Apply a reviewer decision to a parked job.
    ///
    /// Fails with `StaleState`, leaving the job untouched, unless the job is
    /// parked exactly at `request.at`.
    pub fn release(job: &mut Job, request: ResumeRequest) -> Result<GateDecision, PipelineError> {
        if !request.at.is_review() || job.state != request.at {
            return Err(PipelineError::StaleState {
                job_id: job.id.clone(),
                expected: request.at,
                actual: job.state,
            });
        }

        let gate = request.at;
        let approved = request.approved;
        let notes = request.notes.clone();
        job.reviews.insert(
            gate,
            ReviewInput {
                approved,
                answers: request.answers,
                notes: request.notes,
                received_at: Utc::now(),
            },
        );

        if !approved {
            let reason = match notes {
                Some(n) if !n.trim().is_empty() => format!("rejected by reviewer at {gate}: {n}"),
                _ => format!("rejected by reviewer at {gate}"),
            };
            info!(job_id = %job.id, %gate, "review rejected");
            StateMachine::fail(job, reason)?;
            return Ok(GateDecision::Rejected);
        }

        let next = StateMachine::advance(job)?;
        info!(job_id = %job.id, %gate, %next, "review approved");
        Ok(GateDecision::Advanced(next))
    }
}
