//! Collaborator contracts consumed by the engine, and an LLM-backed
//! implementation of both over the Anthropic Messages API.
//!
//! Backends return raw text. Parsing and schema validation happen in the
//! components that consume them, so a bad response is always attributed to
//! the stage that asked for it.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::warn;

use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest};
use crate::error::{ErrorClass, PipelineError};
use crate::pipeline::{Documents, Stage, StageContext};
use crate::retry::RetryPolicy;

/// Stage name used in prompts and errors for the judgment pass.
pub const AUDIT_STAGE: &str = "auditing";

/// Produces raw stage output for one generation stage.
pub trait GenerationBackend: Send + Sync {
    fn generate(
        &self,
        stage: Stage,
        context: &StageContext,
    ) -> impl Future<Output = Result<String, PipelineError>> + Send;
}

/// Renders a judgment over a document set.
pub trait JudgmentBackend: Send + Sync {
    fn judge(
        &self,
        documents: &Documents,
        sources: &AuditSources,
    ) -> impl Future<Output = Result<String, PipelineError>> + Send;
}

/// The ground truth the judgment pass checks documents against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditSources {
    pub job_description: String,
    pub baseline_document: String,
    pub sources: Vec<String>,
}

const SYSTEM_PROMPT: &str = "You are one step of a document tailoring pipeline. \
Respond with ONLY a single valid JSON object, no other text. \
Every response must include a numeric \"confidence\" field between 0 and 1.";

/// Output format instructions for each stage.
fn stage_instructions(stage: Stage) -> &'static str {
    match stage {
        Stage::GapAnalysis => {
            "Compare the baseline document against the job description.\n\
             Format: {\"fit_score\": <0-100>, \"matched_requirements\": [\"...\"], \
             \"gaps\": [{\"requirement\": \"...\", \"importance\": \"critical|important|nice_to_have\"}], \
             \"confidence\": <0-1>}"
        }
        Stage::Interrogation => {
            "Ask the candidate targeted questions that could close the identified gaps.\n\
             Format: {\"questions\": [{\"id\": \"q1\", \"question\": \"...\", \"target_gap\": \"...\"}], \
             \"confidence\": <0-1>}"
        }
        Stage::Differentiation => {
            "Using the gap analysis and the candidate's answers, state what sets the candidate apart.\n\
             Format: {\"positioning_statement\": \"...\", \"differentiators\": [\"...\"], \
             \"confidence\": <0-1>}"
        }
        Stage::Tailoring => {
            "Rewrite the baseline document for this job. Never invent facts absent from the sources.\n\
             If a revision request is present, fix every listed issue in the given documents.\n\
             Format: {\"documents\": {\"resume\": \"...\", \"cover_letter\": \"...\"}, \
             \"changes\": [\"...\"], \"confidence\": <0-1>}"
        }
        Stage::AtsOptimization => {
            "Optimize the tailored documents for applicant tracking systems without changing facts.\n\
             Format: {\"documents\": {\"resume\": \"...\", \"cover_letter\": \"...\"}, \
             \"keyword_coverage\": <0-100>, \"missing_keywords\": [\"...\"], \"confidence\": <0-1>}"
        }
        Stage::ExecutiveSynthesis => {
            "Summarize the application package for the candidate.\n\
             Format: {\"summary\": \"...\", \
             \"recommendation\": \"strong_apply|apply|stretch|skip\", \"confidence\": <0-1>}"
        }
    }
}

const JUDGE_INSTRUCTIONS: &str = "Audit the documents for claims not supported by the sources, \
contradictions, and formatting defects. Unsupported claims are blocking.\n\
Format: {\"status\": \"pass|fail\", \"issues\": [{\"severity\": \"blocking|warning|recommendation\", \
\"category\": \"...\", \"description\": \"...\", \"location\": \"...\"}]}";

/// Build the user prompt for a generation stage.
pub fn stage_prompt(stage: Stage, context: &StageContext) -> Result<String, PipelineError> {
    let context_json = serde_json::to_string_pretty(context)?;
    Ok(format!(
        "[stage:{stage}]\n{}\n\nContext:\n{context_json}",
        stage_instructions(stage)
    ))
}

/// Build the user prompt for the judgment pass.
pub fn judge_prompt(documents: &Documents, sources: &AuditSources) -> Result<String, PipelineError> {
    Ok(format!(
        "[stage:{AUDIT_STAGE}]\n{JUDGE_INSTRUCTIONS}\n\nDocuments:\n{}\n\nSources:\n{}",
        serde_json::to_string_pretty(documents)?,
        serde_json::to_string_pretty(sources)?
    ))
}

/// Generation and judgment over any [`MessageSender`].
pub struct LlmBackend<C> {
    client: C,
    model: String,
    max_tokens: u32,
    policy: RetryPolicy,
}

impl<C: MessageSender> LlmBackend<C> {
    pub fn new(client: C, model: impl Into<String>, max_tokens: u32, policy: RetryPolicy) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
            policy,
        }
    }

    /// Send one prompt, riding out rate limits, server overload and dropped
    /// connections as the policy's transient allowance permits.
    async fn complete(&self, label: &str, prompt: String) -> Result<String, PipelineError> {
        let req = MessagesRequest::single_turn(&self.model, self.max_tokens, SYSTEM_PROMPT, prompt);
        let mut attempt = 0;
        loop {
            let err = match self.client.send_message(&req).await {
                Ok(response) => {
                    if response.is_truncated() {
                        warn!(stage = label, "response hit max_tokens and may be incomplete");
                    }
                    return Ok(response.text());
                }
                Err(e) => PipelineError::from(e),
            };
            if err.class() != ErrorClass::Transient
                || !self.policy.should_retry(ErrorClass::Transient, attempt)
            {
                return Err(PipelineError::execution(label, err.to_string()));
            }
            let delay = self.transient_delay(&err, attempt);
            warn!(
                stage = label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, waiting"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Server hints are honored but never beyond `max_delay`.
    fn transient_delay(&self, err: &PipelineError, attempt: u32) -> Duration {
        let backoff = self.policy.backoff_delay(attempt);
        match err {
            PipelineError::Anthropic(AnthropicError::RateLimited { retry_after_ms }) => {
                Duration::from_millis(*retry_after_ms)
                    .max(backoff)
                    .min(self.policy.max_delay)
            }
            _ => backoff,
        }
    }
}

impl<C: MessageSender> GenerationBackend for LlmBackend<C> {
    async fn generate(&self, stage: Stage, context: &StageContext) -> Result<String, PipelineError> {
        let prompt = stage_prompt(stage, context)?;
        self.complete(stage.as_str(), prompt).await
    }
}

impl<C: MessageSender> JudgmentBackend for LlmBackend<C> {
    async fn judge(&self, documents: &Documents, sources: &AuditSources) -> Result<String, PipelineError> {
        let prompt = judge_prompt(documents, sources)?;
        self.complete(AUDIT_STAGE, prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::anthropic::{ContentBlock, MessagesResponse, Usage};
    use crate::pipeline::{Job, JobInput};

    #[derive(Clone, Copy)]
    enum Failure {
        RateLimited(u64),
        Status(u16),
    }

    struct MockClient {
        failures_before_success: usize,
        failure: Failure,
        calls: AtomicUsize,
        last_prompt: Mutex<Option<String>>,
    }

    impl MockClient {
        fn new(rate_limits_before_success: usize) -> Self {
            Self::failing(rate_limits_before_success, Failure::RateLimited(0))
        }

        fn failing(failures_before_success: usize, failure: Failure) -> Self {
            Self {
                failures_before_success,
                failure,
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(None),
            }
        }
    }

    impl MessageSender for MockClient {
        async fn send_message(
            &self,
            req: &MessagesRequest,
        ) -> Result<MessagesResponse, AnthropicError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = Some(req.messages[0].content.clone());
            if n < self.failures_before_success {
                return Err(match self.failure {
                    Failure::RateLimited(retry_after_ms) => {
                        AnthropicError::RateLimited { retry_after_ms }
                    }
                    Failure::Status(status) => AnthropicError::ApiError {
                        status,
                        message: "mock failure".into(),
                    },
                });
            }
            Ok(MessagesResponse {
                id: "mock".into(),
                content: vec![ContentBlock {
                    content_type: "text".into(),
                    text: r#"{"confidence": 1}"#.into(),
                }],
                model: "mock".into(),
                stop_reason: Some("end_turn".into()),
                usage: Usage {
                    input_tokens: 0,
                    output_tokens: 0,
                },
            })
        }
    }

    fn context() -> StageContext {
        Job::new(JobInput {
            job_description: "SRE, on-call heavy".into(),
            baseline_document: "Ran incident response at scale.".into(),
            sources: Vec::new(),
        })
        .context()
    }

    #[test]
    fn stage_prompt_carries_marker_and_context() {
        let prompt = stage_prompt(Stage::Interrogation, &context()).unwrap();
        assert!(prompt.starts_with("[stage:interrogation]"));
        assert!(prompt.contains("Ran incident response at scale."));
    }

    #[test]
    fn judge_prompt_carries_documents_and_sources() {
        let docs = Documents {
            resume: "Tailored resume".into(),
            cover_letter: None,
        };
        let sources = AuditSources {
            job_description: "JD".into(),
            baseline_document: "Baseline".into(),
            sources: vec!["Letter".into()],
        };
        let prompt = judge_prompt(&docs, &sources).unwrap();
        assert!(prompt.starts_with("[stage:auditing]"));
        assert!(prompt.contains("Tailored resume"));
        assert!(prompt.contains("Letter"));
    }

    #[tokio::test]
    async fn rate_limits_are_ridden_out() {
        let backend = LlmBackend::new(MockClient::new(2), "m", 512, RetryPolicy::immediate());
        let text = backend.generate(Stage::GapAnalysis, &context()).await.unwrap();
        assert_eq!(text, r#"{"confidence": 1}"#);
        assert_eq!(backend.client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_rate_limit_becomes_execution_error() {
        let backend = LlmBackend::new(MockClient::new(usize::MAX), "m", 512, RetryPolicy::immediate());
        let err = backend.generate(Stage::GapAnalysis, &context()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Execution);
        // 1 call + MAX_TRANSIENT_RETRIES
        assert_eq!(backend.client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_wait_is_capped_by_max_delay() {
        let policy = RetryPolicy::default();
        let client = MockClient::failing(1, Failure::RateLimited(3_600_000));
        let backend = LlmBackend::new(client, "m", 512, policy.clone());

        let started = tokio::time::Instant::now();
        backend.generate(Stage::GapAnalysis, &context()).await.unwrap();

        assert!(started.elapsed() <= policy.max_delay);
        assert_eq!(backend.client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn server_overload_uses_transient_allowance() {
        let client = MockClient::failing(2, Failure::Status(529));
        let backend = LlmBackend::new(client, "m", 512, RetryPolicy::default());

        let started = tokio::time::Instant::now();
        backend.generate(Stage::Tailoring, &context()).await.unwrap();

        assert_eq!(backend.client.calls.load(Ordering::SeqCst), 3);
        // base_delay * (1 + 2)
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn persistent_server_error_becomes_execution_error() {
        let client = MockClient::failing(usize::MAX, Failure::Status(503));
        let backend = LlmBackend::new(client, "m", 512, RetryPolicy::immediate());
        let err = backend.generate(Stage::GapAnalysis, &context()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Execution);
        assert_eq!(backend.client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let client = MockClient::failing(usize::MAX, Failure::Status(400));
        let backend = LlmBackend::new(client, "m", 512, RetryPolicy::immediate());
        let err = backend.generate(Stage::GapAnalysis, &context()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Execution);
        assert!(err.to_string().contains("400"), "{err}");
        assert_eq!(backend.client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn judge_uses_auditing_marker() {
        let backend = LlmBackend::new(MockClient::new(0), "m", 512, RetryPolicy::immediate());
        let docs = Documents {
            resume: "R".into(),
            cover_letter: None,
        };
        let sources = AuditSources {
            job_description: "JD".into(),
            baseline_document: "B".into(),
            sources: Vec::new(),
        };
        backend.judge(&docs, &sources).await.unwrap();
        let prompt = backend.client.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.starts_with("[stage:auditing]"));
    }
}
