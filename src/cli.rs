//! Interface de linha de comando do tailorflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, resume, status,
//! list) e flags globais (--config, --model, --max-audit-retries, --verbose).

use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

use crate::pipeline::WorkflowState;

/// tailorflow: adapta currículo e carta a uma vaga com revisão humana e auditoria.
#[derive(Debug, Parser)]
#[command(name = "tailorflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Modelo a usar nesta sessão (sobrepõe o arquivo).
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Teto do loop de correção da auditoria.
    #[arg(long, global = true)]
    pub max_audit_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria um job e executa até o primeiro ponto de revisão.
    Run {
        /// Arquivo com a descrição da vaga.
        #[arg(long)]
        job_description: PathBuf,

        /// Arquivo com o currículo base.
        #[arg(long)]
        resume: PathBuf,

        /// Material de apoio adicional (repetível).
        #[arg(long = "source")]
        sources: Vec<PathBuf>,
    },

    /// Libera um job parado em revisão e continua a execução.
    #[command(group(ArgGroup::new("decision").required(true).args(["approve", "reject"])))]
    Resume {
        job_id: String,

        /// Estado de revisão que esta decisão libera.
        #[arg(long)]
        at: WorkflowState,

        #[arg(long)]
        approve: bool,

        #[arg(long)]
        reject: bool,

        /// Arquivo JSON com respostas `{"q1": "..."}` para a entrevista.
        #[arg(long)]
        answers: Option<PathBuf>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Mostra o snapshot de um job.
    Status { job_id: String },

    /// Lista os jobs persistidos.
    List,
}
