//! The workflow engine: drives one job at a time through the pipeline.
//!
//! The engine owns no jobs. It loads a job from the injected [`JobStore`],
//! mutates it as the single writer while driving it, and saves after every
//! transition. Each `run`/`resume` call returns when the job is parked at a
//! review gate, terminal, or cancelled.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::AuditController;
use crate::backend::{AuditSources, GenerationBackend, JudgmentBackend};
use crate::error::PipelineError;
use crate::events::{EventKind, EventStream, ProgressPublisher, terminal_kind};
use crate::hitl::{GateDecision, HitlGate, ResumeRequest};
use crate::invoker::AgentInvoker;
use crate::pipeline::{
    Job, JobInput, JobSnapshot, Stage, StateMachine, WorkflowState,
};
use crate::retry::RetryPolicy;
use crate::store::JobStore;

pub const CANCELLED_MESSAGE: &str = "cancelled by operator";

pub struct WorkflowEngine<G, J, S> {
    store: Arc<S>,
    invoker: Arc<AgentInvoker<G>>,
    auditor: AuditController<G, J>,
    publisher: Arc<ProgressPublisher>,
    policy: RetryPolicy,
    cancelled: Mutex<HashSet<String>>,
}

impl<G, J, S> WorkflowEngine<G, J, S>
where
    G: GenerationBackend + 'static,
    J: JudgmentBackend + 'static,
    S: JobStore + 'static,
{
    pub fn new(
        generation: G,
        judgment: J,
        store: Arc<S>,
        publisher: Arc<ProgressPublisher>,
        policy: RetryPolicy,
    ) -> Self {
        let invoker = Arc::new(AgentInvoker::new(generation, policy.clone()));
        let auditor = AuditController::new(Arc::clone(&invoker), judgment, policy.clone());
        Self {
            store,
            invoker,
            auditor,
            publisher,
            policy,
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn invoker(&self) -> &AgentInvoker<G> {
        &self.invoker
    }

    /// Validate inputs and persist a new job in `initialized`.
    pub async fn create_job(&self, input: JobInput) -> Result<Job, PipelineError> {
        input.validate()?;
        let job = Job::new(input);
        self.store.save_job(&job).await?;
        info!(job_id = %job.id, sources = job.input.sources.len(), "job created");
        Ok(job)
    }

    /// Drive a stored job until it parks, finishes, or is cancelled.
    ///
    /// Stage failures do not surface here: they move the job to `failed` and
    /// the returned job carries the error message. `Err` means the engine
    /// itself could not proceed (unknown job, store failure).
    pub async fn run(&self, job_id: &str) -> Result<Job, PipelineError> {
        let mut job = self.store.load_job(job_id).await?;
        self.drive(&mut job).await?;
        Ok(job)
    }

    /// Run a job as its own task.
    pub fn spawn(self: &Arc<Self>, job_id: &str) -> JoinHandle<Result<Job, PipelineError>> {
        let engine = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move { engine.run(&job_id).await })
    }

    /// Release a review gate and keep driving the job.
    ///
    /// A request that does not match the gate the job is parked at fails with
    /// `StaleState` and leaves the stored job untouched.
    pub async fn resume(&self, job_id: &str, request: ResumeRequest) -> Result<Job, PipelineError> {
        let mut job = self.store.load_job(job_id).await?;
        let from = job.state;
        let decision = HitlGate::release(&mut job, request)?;
        self.commit(&job, from).await?;

        if let GateDecision::Advanced(_) = decision {
            self.drive(&mut job).await?;
        }
        Ok(job)
    }

    /// Ask the engine to stop `job_id` before its next stage.
    ///
    /// An in-flight stage call is allowed to finish.
    pub fn cancel(&self, job_id: &str) {
        info!(job_id, "cancellation requested");
        self.cancel_flags().insert(job_id.to_string());
    }

    pub async fn status(&self, job_id: &str) -> Result<JobSnapshot, PipelineError> {
        Ok(self.store.load_job(job_id).await?.snapshot())
    }

    pub async fn list(&self) -> Result<Vec<JobSnapshot>, PipelineError> {
        Ok(self
            .store
            .list_jobs()
            .await?
            .iter()
            .map(Job::snapshot)
            .collect())
    }

    /// Progress stream for a job, starting with a `connected` snapshot event.
    pub async fn subscribe(&self, job_id: &str) -> Result<EventStream, PipelineError> {
        let job = self.store.load_job(job_id).await?;
        Ok(self.publisher.subscribe_with_snapshot(&job))
    }

    async fn drive(&self, job: &mut Job) -> Result<(), PipelineError> {
        loop {
            if job.is_terminal() {
                return Ok(());
            }
            if job.state.is_review() {
                info!(job_id = %job.id, state = %job.state, "parked for review");
                self.publisher
                    .log(&job.id, format!("awaiting review at {}", job.state));
                return Ok(());
            }
            if self.take_cancel(&job.id) {
                self.fail(job, CANCELLED_MESSAGE).await?;
                return Ok(());
            }

            match (job.state, Stage::for_state(job.state)) {
                (WorkflowState::Initialized, _) => self.advance(job).await?,
                (WorkflowState::Auditing, _) => self.run_audit(job).await?,
                (_, Some(stage)) => self.run_stage(job, stage).await?,
                (state, None) => {
                    return Err(PipelineError::InvalidTransition {
                        from: state,
                        to: state,
                    });
                }
            }
        }
    }

    async fn run_stage(&self, job: &mut Job, stage: Stage) -> Result<(), PipelineError> {
        if job.result(stage).is_some() {
            info!(job_id = %job.id, %stage, "result already present, skipping stage");
            self.publisher
                .log(&job.id, format!("{stage}: reusing stored result"));
            return self.advance(job).await;
        }

        info!(job_id = %job.id, %stage, "running stage");
        self.publisher.log(&job.id, format!("{stage}: started"));
        let context = job.context();
        match self.invoker.invoke(stage, &context).await {
            Ok(result) => {
                let confidence = result.confidence;
                job.record_result(result)?;
                self.publisher
                    .publish(&job.id, EventKind::StageCompleted { stage, confidence });
                self.advance(job).await
            }
            Err(e) => {
                warn!(job_id = %job.id, %stage, error = %e, "stage failed after retries");
                self.fail(job, format!("{stage} failed: {e}")).await
            }
        }
    }

    async fn run_audit(&self, job: &mut Job) -> Result<(), PipelineError> {
        if job.audit_report.is_some() {
            info!(job_id = %job.id, "audit report already present, skipping audit");
            return self.advance(job).await;
        }

        let Some(documents) = job.latest_documents().cloned() else {
            return self.fail(job, "no documents available to audit").await;
        };
        let sources = AuditSources {
            job_description: job.input.job_description.clone(),
            baseline_document: job.input.baseline_document.clone(),
            sources: job.input.sources.clone(),
        };

        self.publisher.log(&job.id, "auditing: started");
        let context = job.context();
        let outcome = match self
            .auditor
            .audit_with_retry(&context, documents, &sources, self.policy.max_audit_retries)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "audit regeneration failed after retries");
                return self.fail(job, format!("auditing failed: {e}")).await;
            }
        };

        let report = outcome.report;
        info!(
            job_id = %job.id,
            status = %report.final_status,
            retry_count = report.retry_count,
            "audit finished"
        );
        self.publisher.log(
            &job.id,
            format!(
                "auditing: {} after {} correction(s)",
                report.final_status, report.retry_count
            ),
        );
        job.audit_failed = !report.is_approved();
        job.final_documents = Some(outcome.documents);
        job.audit_report = Some(report);

        // The verdict is on the job before the loop is replayed, so a restart
        // mid-replay skips the audit instead of judging stale documents again.
        for regenerated in outcome.regenerations {
            let confidence = regenerated.confidence;
            StateMachine::transition(job, WorkflowState::Tailoring)?;
            job.replace_regenerated(regenerated)?;
            self.commit(job, WorkflowState::Auditing).await?;
            self.publisher.publish(
                &job.id,
                EventKind::StageCompleted {
                    stage: Stage::Tailoring,
                    confidence,
                },
            );
            self.step(job, WorkflowState::Auditing).await?;
        }
        self.advance(job).await
    }

    async fn advance(&self, job: &mut Job) -> Result<(), PipelineError> {
        let from = job.state;
        let to = StateMachine::advance(job)?;
        if to == WorkflowState::Completed {
            job.success = true;
        }
        self.commit(job, from).await
    }

    async fn step(&self, job: &mut Job, to: WorkflowState) -> Result<(), PipelineError> {
        let from = job.state;
        StateMachine::transition(job, to)?;
        self.commit(job, from).await
    }

    async fn fail(&self, job: &mut Job, message: impl Into<String>) -> Result<(), PipelineError> {
        let from = job.state;
        let message = message.into();
        warn!(job_id = %job.id, state = %from, error = %message, "job failed");
        StateMachine::fail(job, message)?;
        self.commit(job, from).await
    }

    /// Persist the job, then tell subscribers about the transition from `from`.
    async fn commit(&self, job: &Job, from: WorkflowState) -> Result<(), PipelineError> {
        self.store.save_job(job).await?;
        info!(job_id = %job.id, %from, to = %job.state, "state transition");
        self.publisher.publish(
            &job.id,
            EventKind::StateChanged {
                from,
                to: job.state,
                progress: job.progress(),
            },
        );
        if job.is_terminal() {
            self.take_cancel(&job.id);
            self.publisher.publish(&job.id, terminal_kind(job));
        }
        Ok(())
    }

    fn take_cancel(&self, job_id: &str) -> bool {
        self.cancel_flags().remove(job_id)
    }

    fn cancel_flags(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
