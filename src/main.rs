use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tailorflow::anthropic::AnthropicClient;
use tailorflow::backend::LlmBackend;
use tailorflow::cli::{Cli, Command};
use tailorflow::config::TailorflowConfig;
use tailorflow::engine::WorkflowEngine;
use tailorflow::events::{EventStream, ProgressPublisher};
use tailorflow::hitl::ResumeRequest;
use tailorflow::pipeline::{Job, JobInput, WorkflowState};
use tailorflow::store::FileJobStore;
use tailorflow::ui::{self, JobProgress};

type Backend = LlmBackend<AnthropicClient>;
type Engine = WorkflowEngine<Backend, Backend, FileJobStore>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "tailorflow=debug"
    } else {
        "tailorflow=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => TailorflowConfig::load_from(path)?,
        None => TailorflowConfig::load()?,
    };
    if let Some(model) = cli.model {
        config.model = model;
    }
    if let Some(ceiling) = cli.max_audit_retries {
        config.max_audit_retries = ceiling;
    }

    let engine = Arc::new(build_engine(&config).await?);

    match cli.command {
        Command::Run {
            job_description,
            resume,
            sources,
        } => {
            config.require_api_key()?;
            let input = JobInput {
                job_description: read(&job_description)?,
                baseline_document: read(&resume)?,
                sources: sources.iter().map(|p| read(p)).collect::<Result<_>>()?,
            };
            let job = engine.create_job(input).await?;
            println!("Created job {}", job.id);

            let events = engine.subscribe(&job.id).await?;
            let handle = engine.spawn(&job.id);
            let job = follow(&job.id, events, async { Ok::<_, anyhow::Error>(handle.await??) }).await?;
            exit_code(&job)
        }
        Command::Resume {
            job_id,
            at,
            approve,
            reject: _,
            answers,
            notes,
        } => {
            config.require_api_key()?;
            let answers: BTreeMap<String, String> = match answers {
                Some(path) => serde_json::from_str(&read(&path)?)
                    .with_context(|| format!("parsing answers in {}", path.display()))?,
                None => BTreeMap::new(),
            };
            let request = ResumeRequest {
                at,
                approved: approve,
                answers,
                notes,
            };

            let events = engine.subscribe(&job_id).await?;
            let job = follow(&job_id, events, async {
                Ok::<_, anyhow::Error>(engine.resume(&job_id, request).await?)
            })
            .await?;
            exit_code(&job)
        }
        Command::Status { job_id } => {
            ui::print_snapshot(&engine.status(&job_id).await?);
            Ok(())
        }
        Command::List => {
            let jobs = engine.list().await?;
            if jobs.is_empty() {
                println!("No jobs in {}", config.store_dir.display());
            }
            for snapshot in &jobs {
                println!("{}", ui::snapshot_line(snapshot));
            }
            Ok(())
        }
    }
}

async fn build_engine(config: &TailorflowConfig) -> Result<Engine> {
    let policy = config.retry_policy();
    let backend = || {
        LlmBackend::new(
            AnthropicClient::with_base_url(config.api_key.clone(), config.api_url.clone()),
            config.model.clone(),
            config.max_tokens,
            policy.clone(),
        )
    };
    let store = FileJobStore::open(&config.store_dir)
        .await
        .with_context(|| format!("opening job store at {}", config.store_dir.display()))?;

    Ok(WorkflowEngine::new(
        backend(),
        backend(),
        Arc::new(store),
        Arc::new(ProgressPublisher::new()),
        policy,
    ))
}

/// Render progress events while `work` drives the job.
async fn follow<F>(job_id: &str, mut events: EventStream, work: F) -> Result<Job>
where
    F: Future<Output = Result<Job>>,
{
    let progress = JobProgress::start(job_id);
    tokio::pin!(work);

    let job = loop {
        tokio::select! {
            Some(event) = events.recv() => progress.handle(&event),
            done = &mut work => break done?,
        }
    };
    while let Ok(event) = events.try_recv() {
        progress.handle(&event);
    }
    progress.finish(&job);
    Ok(job)
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn exit_code(job: &Job) -> Result<()> {
    if job.state == WorkflowState::Failed {
        std::process::exit(1);
    }
    Ok(())
}
