//! Truth audit with bounded automatic correction.
//!
//! [`AuditController::audit_with_retry`] returns an [`AuditReport`] for every
//! judgment outcome. Rejection and judge crashes are outcomes, not errors: the
//! pipeline finishing and the documents being trustworthy are separate
//! signals. Only a failed tailoring regeneration surfaces as an error, like
//! any other stage failure.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::backend::{AUDIT_STAGE, AuditSources, GenerationBackend, JudgmentBackend};
use crate::error::{ErrorClass, PipelineError};
use crate::invoker::AgentInvoker;
use crate::pipeline::stage::{decode, extract_json};
use crate::pipeline::{Documents, RevisionRequest, Stage, StageContext, StageResult};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Warning,
    Recommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditIssue {
    pub severity: Severity,
    pub category: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl AuditIssue {
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgmentStatus {
    Pass,
    Fail,
}

/// One structured answer from the judgment backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub status: JudgmentStatus,
    #[serde(default)]
    pub issues: Vec<AuditIssue>,
}

impl Judgment {
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let value = extract_json(raw).map_err(|e| PipelineError::execution(AUDIT_STAGE, e.0))?;
        decode(value).map_err(|e| PipelineError::execution(AUDIT_STAGE, e.0))
    }

    pub fn blocking(&self) -> Vec<AuditIssue> {
        self.issues.iter().filter(|i| i.is_blocking()).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Approved,
    Rejected,
    AuditCrashed,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditStatus::Approved => write!(f, "APPROVED"),
            AuditStatus::Rejected => write!(f, "REJECTED"),
            AuditStatus::AuditCrashed => write!(f, "AUDIT_CRASHED"),
        }
    }
}

/// Issues reported by a single judgment pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditPass {
    pub retry: u32,
    pub issues: Vec<AuditIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub final_status: AuditStatus,
    pub retry_count: u32,
    /// Issues from the most recent judgment pass.
    pub issues: Vec<AuditIssue>,
    /// Every pass, oldest first.
    #[serde(default)]
    pub passes: Vec<AuditPass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_error: Option<String>,
}

impl AuditReport {
    pub fn is_approved(&self) -> bool {
        self.final_status == AuditStatus::Approved
    }

    pub fn blocking_issues(&self) -> impl Iterator<Item = &AuditIssue> {
        self.issues.iter().filter(|i| i.is_blocking())
    }
}

/// Result of an audit run: the report, the documents it judged last, and any
/// tailoring regenerations produced along the way.
#[derive(Debug, Clone)]
pub struct AuditOutcome {
    pub report: AuditReport,
    pub documents: Documents,
    pub regenerations: Vec<StageResult>,
}

pub struct AuditController<G, J> {
    invoker: Arc<AgentInvoker<G>>,
    judge: J,
    policy: RetryPolicy,
}

impl<G: GenerationBackend, J: JudgmentBackend> AuditController<G, J> {
    pub fn new(invoker: Arc<AgentInvoker<G>>, judge: J, policy: RetryPolicy) -> Self {
        Self {
            invoker,
            judge,
            policy,
        }
    }

    pub fn judge(&self) -> &J {
        &self.judge
    }

    /// Judge `documents`, regenerating through the tailoring stage while
    /// blocking issues remain and fewer than `ceiling` corrections were made.
    ///
    /// Fails only when a regeneration exhausts its retries.
    pub async fn audit_with_retry(
        &self,
        context: &StageContext,
        documents: Documents,
        sources: &AuditSources,
        ceiling: u32,
    ) -> Result<AuditOutcome, PipelineError> {
        let policy = self.policy.with_audit_ceiling(ceiling);
        let mut documents = documents;
        let mut retry_count = 0;
        let mut passes: Vec<AuditPass> = Vec::new();
        let mut regenerations = Vec::new();

        loop {
            let judgment = match self.judge_once(&documents, sources).await {
                Ok(judgment) => judgment,
                Err(e) => {
                    warn!(retry_count, error = %e, "audit judge crashed");
                    let report = crashed(retry_count, passes, format!("judgment failed: {e}"));
                    return Ok(AuditOutcome {
                        report,
                        documents,
                        regenerations,
                    });
                }
            };

            let blocking = judgment.blocking();
            info!(
                retry_count,
                blocking = blocking.len(),
                total = judgment.issues.len(),
                "audit pass complete"
            );
            passes.push(AuditPass {
                retry: retry_count,
                issues: judgment.issues.clone(),
            });

            if blocking.is_empty() {
                let report = AuditReport {
                    final_status: AuditStatus::Approved,
                    retry_count,
                    issues: judgment.issues,
                    passes,
                    rejection_reason: None,
                    crash_error: None,
                };
                return Ok(AuditOutcome {
                    report,
                    documents,
                    regenerations,
                });
            }

            if !policy.should_retry(ErrorClass::Audit, retry_count) {
                let reason = format!(
                    "{} blocking issue(s) remain after {retry_count} correction attempt(s): {}",
                    blocking.len(),
                    blocking
                        .iter()
                        .map(|i| i.description.as_str())
                        .collect::<Vec<_>>()
                        .join("; ")
                );
                warn!(retry_count, "audit rejected documents");
                let report = AuditReport {
                    final_status: AuditStatus::Rejected,
                    retry_count,
                    issues: judgment.issues,
                    passes,
                    rejection_reason: Some(reason),
                    crash_error: None,
                };
                return Ok(AuditOutcome {
                    report,
                    documents,
                    regenerations,
                });
            }

            let revision = RevisionRequest {
                documents: documents.clone(),
                issues: blocking,
            };
            let regen_context = context.clone().with_revision(revision);
            let result = self
                .invoker
                .invoke(Stage::Tailoring, &regen_context)
                .await
                .inspect_err(|e| warn!(retry_count, error = %e, "regeneration failed during audit"))?;
            if let Some(regenerated) = result.output.documents() {
                documents = regenerated.clone();
            }
            regenerations.push(result);
            retry_count += 1;
            info!(retry_count, "documents regenerated for re-audit");
        }
    }

    /// One judgment with its own retry allotment for malformed or failed calls.
    async fn judge_once(
        &self,
        documents: &Documents,
        sources: &AuditSources,
    ) -> Result<Judgment, PipelineError> {
        let mut attempt = 0;
        loop {
            let result = match self.judge.judge(documents, sources).await {
                Ok(raw) => Judgment::parse(&raw),
                Err(e) => Err(e),
            };
            match result {
                Ok(judgment) => return Ok(judgment),
                Err(e) if self.policy.should_retry(ErrorClass::Execution, attempt) => {
                    warn!(attempt = attempt + 1, error = %e, "retrying audit judgment");
                    sleep(self.policy.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn crashed(retry_count: u32, passes: Vec<AuditPass>, detail: String) -> AuditReport {
    let issues = passes.last().map(|p| p.issues.clone()).unwrap_or_default();
    AuditReport {
        final_status: AuditStatus::AuditCrashed,
        retry_count,
        issues,
        passes,
        rejection_reason: None,
        crash_error: Some(detail),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::invoker::tests::ScriptedBackend;
    use crate::pipeline::{Job, JobInput};

    pub(crate) const PASS: &str = r#"{"status": "pass", "issues": [
        {"severity": "warning", "category": "tone", "description": "a bit stiff"}]}"#;
    pub(crate) const FAIL: &str = r#"{"status": "fail", "issues": [
        {"severity": "blocking", "category": "fabrication", "description": "claims a PhD",
         "location": "education"}]}"#;
    pub(crate) const TAILORED: &str =
        r#"{"documents": {"resume": "fixed resume"}, "changes": ["removed PhD"], "confidence": 0.8}"#;

    /// Replays judgments; once the script runs dry the last entry repeats.
    pub(crate) struct ScriptedJudge {
        script: Mutex<VecDeque<Result<String, String>>>,
        last: Mutex<Option<Result<String, String>>>,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedJudge {
        pub(crate) fn new(script: Vec<Result<&str, &str>>) -> Self {
            Self {
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|r| r.map(String::from).map_err(String::from))
                        .collect(),
                ),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl JudgmentBackend for ScriptedJudge {
        async fn judge(
            &self,
            _documents: &Documents,
            _sources: &AuditSources,
        ) -> Result<String, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            let entry = match next {
                Some(entry) => {
                    *self.last.lock().unwrap() = Some(entry.clone());
                    entry
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| Err("no judgment scripted".into())),
            };
            entry.map_err(|message| PipelineError::execution(AUDIT_STAGE, message))
        }
    }

    fn controller(
        generation: Vec<Result<&str, &str>>,
        judgments: Vec<Result<&str, &str>>,
    ) -> AuditController<ScriptedBackend, ScriptedJudge> {
        let invoker = Arc::new(AgentInvoker::new(
            ScriptedBackend::new(generation),
            RetryPolicy::immediate(),
        ));
        AuditController::new(invoker, ScriptedJudge::new(judgments), RetryPolicy::immediate())
    }

    fn context() -> StageContext {
        Job::new(JobInput {
            job_description: "Data engineer".into(),
            baseline_document: "BSc, pipelines at scale.".into(),
            sources: Vec::new(),
        })
        .context()
    }

    fn sources() -> AuditSources {
        AuditSources {
            job_description: "Data engineer".into(),
            baseline_document: "BSc, pipelines at scale.".into(),
            sources: Vec::new(),
        }
    }

    fn draft() -> Documents {
        Documents {
            resume: "draft resume with PhD".into(),
            cover_letter: None,
        }
    }

    #[tokio::test]
    async fn clean_pass_is_approved_with_warnings_kept() {
        let ctl = controller(vec![], vec![Ok(PASS)]);
        let outcome = ctl.audit_with_retry(&context(), draft(), &sources(), 2).await.unwrap();

        assert_eq!(outcome.report.final_status, AuditStatus::Approved);
        assert_eq!(outcome.report.retry_count, 0);
        assert_eq!(outcome.report.issues.len(), 1);
        assert_eq!(outcome.report.issues[0].severity, Severity::Warning);
        assert!(outcome.regenerations.is_empty());
        assert_eq!(outcome.documents, draft());
    }

    #[tokio::test]
    async fn blocking_issue_is_corrected_then_approved() {
        let ctl = controller(vec![Ok(TAILORED)], vec![Ok(FAIL), Ok(PASS)]);
        let outcome = ctl.audit_with_retry(&context(), draft(), &sources(), 2).await.unwrap();

        assert!(outcome.report.is_approved());
        assert_eq!(outcome.report.retry_count, 1);
        assert_eq!(outcome.report.passes.len(), 2);
        assert_eq!(outcome.documents.resume, "fixed resume");
        assert_eq!(outcome.regenerations.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_ceiling_rejects_but_keeps_documents() {
        let ctl = controller(
            vec![Ok(TAILORED), Ok(TAILORED), Ok(TAILORED)],
            vec![Ok(FAIL), Ok(FAIL), Ok(FAIL)],
        );
        let outcome = ctl.audit_with_retry(&context(), draft(), &sources(), 2).await.unwrap();

        assert_eq!(outcome.report.final_status, AuditStatus::Rejected);
        assert_eq!(outcome.report.retry_count, 2);
        assert_eq!(ctl.invoker.backend().calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctl.judge().calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.regenerations.len(), 2);
        assert_eq!(outcome.documents.resume, "fixed resume");
        let reason = outcome.report.rejection_reason.as_deref().unwrap();
        assert!(reason.contains("claims a PhD"), "{reason}");
        assert_eq!(outcome.report.blocking_issues().count(), 1);
    }

    #[tokio::test]
    async fn zero_ceiling_rejects_without_regenerating() {
        let ctl = controller(vec![], vec![Ok(FAIL)]);
        let outcome = ctl.audit_with_retry(&context(), draft(), &sources(), 0).await.unwrap();

        assert_eq!(outcome.report.final_status, AuditStatus::Rejected);
        assert_eq!(outcome.report.retry_count, 0);
        assert_eq!(ctl.invoker.backend().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn judge_crash_is_a_result() {
        let ctl = controller(vec![], vec![Err("judge exploded")]);
        let outcome = ctl.audit_with_retry(&context(), draft(), &sources(), 2).await.unwrap();

        assert_eq!(outcome.report.final_status, AuditStatus::AuditCrashed);
        let detail = outcome.report.crash_error.unwrap();
        assert!(detail.contains("judge exploded"), "{detail}");
        // one retry for the judgment itself
        assert_eq!(ctl.judge().calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.documents, draft());
    }

    #[tokio::test]
    async fn malformed_judgment_is_retried_before_crashing() {
        let ctl = controller(vec![], vec![Ok("no verdict today"), Ok(PASS)]);
        let outcome = ctl.audit_with_retry(&context(), draft(), &sources(), 2).await.unwrap();
        assert!(outcome.report.is_approved());
        assert_eq!(ctl.judge().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_regeneration_is_a_stage_error() {
        let ctl = controller(vec![Err("down"), Err("down")], vec![Ok(FAIL)]);
        let err = ctl
            .audit_with_retry(&context(), draft(), &sources(), 2)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Execution { .. }), "{err}");
        assert!(err.to_string().contains("tailoring"), "{err}");
        // the judge itself never failed
        assert_eq!(ctl.judge().calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.invoker.backend().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn audit_status_serializes_screaming_case() {
        let json = serde_json::to_string(&AuditStatus::AuditCrashed).unwrap();
        assert_eq!(json, r#""AUDIT_CRASHED""#);
        assert_eq!(AuditStatus::Rejected.to_string(), "REJECTED");
    }
}
