//! Interface de terminal do tailorflow: spinner e saída colorida.
//!
//! Usa `indicatif` para o spinner de progresso e `console` para cores. O
//! [`JobProgress`] consome o stream de [`ProgressEvent`] de um job e imprime
//! o snapshot final.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::audit::{AuditReport, AuditStatus, Severity};
use crate::events::{EventKind, ProgressEvent};
use crate::hitl::HitlGate;
use crate::pipeline::{Job, JobSnapshot, StageOutput, WorkflowState};

/// Indicador visual de progresso para a execução de um job no terminal.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl JobProgress {
    /// Inicia o spinner para o job e retorna a instância de progresso.
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} [{pos:>3}%] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("job {job_id}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza o spinner a partir de um evento do job.
    pub fn handle(&self, event: &ProgressEvent) {
        match &event.kind {
            EventKind::Connected { state, progress } => {
                self.pb.set_position(u64::from(*progress));
                self.pb.set_message(state.to_string());
            }
            EventKind::StateChanged { to, progress, .. } => {
                self.pb.set_position(u64::from(*progress));
                self.pb.set_message(to.to_string());
            }
            EventKind::LogLine { message } => {
                self.pb.println(format!("  {}", self.dim.apply_to(message)));
            }
            EventKind::StageCompleted { stage, confidence } => {
                self.pb.println(format!(
                    "  {} {stage} (confidence {confidence:.2})",
                    self.green.apply_to("✓")
                ));
            }
            EventKind::JobTerminal { .. } => self.pb.finish_and_clear(),
        }
    }

    /// Finaliza o spinner e exibe o resultado do job.
    ///
    /// Concluir o pipeline e passar na auditoria são mostrados separadamente.
    pub fn finish(&self, job: &Job) {
        self.pb.finish_and_clear();
        match job.state {
            WorkflowState::Completed if !job.audit_failed => {
                println!("  {} Job {} completed", self.green.apply_to("✓"), job.id);
            }
            WorkflowState::Completed => {
                println!(
                    "  {} Job {} completed, but the documents did not pass the audit",
                    self.yellow.apply_to("!"),
                    job.id
                );
            }
            WorkflowState::Failed => {
                println!(
                    "  {} Job {} failed: {}",
                    self.red.apply_to("✗"),
                    job.id,
                    job.error_message.as_deref().unwrap_or("unknown error")
                );
            }
            state if state.is_review() => self.print_review(job),
            state => println!("  Job {} stopped at {state}", job.id),
        }
        if let Some(report) = &job.audit_report {
            self.print_audit(report);
        }
    }

    /// Mostra o artefato que aguarda revisão e como liberar o job.
    fn print_review(&self, job: &Job) {
        println!(
            "  {} Job {} is waiting for review at {}",
            self.yellow.apply_to("⏸"),
            job.id,
            job.state
        );
        match HitlGate::artifact(job).map(|result| &result.output) {
            Some(StageOutput::GapAnalysis(gap)) => {
                println!("    fit score: {}", gap.fit_score);
                for g in &gap.gaps {
                    println!("    - {} ({:?})", g.requirement, g.importance);
                }
            }
            Some(StageOutput::Interrogation(interrogation)) => {
                for q in &interrogation.questions {
                    println!("    [{}] {}", q.id, q.question);
                }
            }
            _ => {}
        }
        println!(
            "  {}",
            self.dim.apply_to(format!(
                "tailorflow resume {} --at {} --approve",
                job.id, job.state
            ))
        );
    }

    /// Imprime o relatório de auditoria com destaque por severidade.
    pub fn print_audit(&self, report: &AuditReport) {
        let status_style = match report.final_status {
            AuditStatus::Approved => &self.green,
            AuditStatus::Rejected => &self.red,
            AuditStatus::AuditCrashed => &self.yellow,
        };
        println!();
        println!(
            "{}",
            status_style.apply_to(format!(
                "─── Audit: {} after {} correction(s) ───",
                report.final_status, report.retry_count
            ))
        );
        for issue in &report.issues {
            let marker = match issue.severity {
                Severity::Blocking => self.red.apply_to("blocking"),
                Severity::Warning => self.yellow.apply_to("warning"),
                Severity::Recommendation => self.dim.apply_to("note"),
            };
            println!("  [{marker}] {}: {}", issue.category, issue.description);
        }
        if let Some(reason) = &report.rejection_reason {
            println!("  {reason}");
        }
        if let Some(error) = &report.crash_error {
            println!("  {}", self.yellow.apply_to(error));
        }
    }
}

/// Imprime um snapshot como JSON formatado.
pub fn print_snapshot(snapshot: &JobSnapshot) {
    println!(
        "{}",
        serde_json::to_string_pretty(snapshot).unwrap_or_default()
    );
}

/// Uma linha por job para `list`.
pub fn snapshot_line(snapshot: &JobSnapshot) -> String {
    let audit = match &snapshot.audit_report {
        Some(report) => report.final_status.to_string(),
        None => "-".to_string(),
    };
    format!(
        "{}  {:<22} {:>3}%  audit={}  created={}",
        snapshot.job_id,
        snapshot.state.as_str(),
        snapshot.progress,
        audit,
        snapshot.created_at.format("%Y-%m-%d %H:%M")
    )
}
