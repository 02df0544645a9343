use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use loadstar_core::{collection, Config, JobKind, JobParameters};
use loadstar_ingest::{
    run_maintenance, sweep_once, CancellationRegistry, IngestService, LoadKind, LoadOutcome, Loader,
};
use loadstar_tracker::JobQuery;

use crate::cli::{Command, JobsCommand};

/// Job id the registry uses for one-off loader runs.
const DIRECT_LOAD_ID: &str = "direct-load";

pub async fn execute(command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Ingest { bucket, path, recursive, year, collection } => {
            let service = open_service(config)?;
            let parameters = JobParameters {
                bucket,
                path,
                recursive,
                year,
                collection_id: collection,
                kind: JobKind::Ingest,
            };
            let (job_id, handle) = service.start_ingest(parameters)?;
            follow(&service, &job_id, handle).await
        }
        Command::Synthetic { name, tasks, concurrency } => {
            let service = open_service(config)?;
            let (job_id, handle) = service.start_synthetic(&name, tasks, concurrency)?;
            follow(&service, &job_id, handle).await
        }
        Command::Jobs { command } => jobs(&open_service(config)?, command).await,
        Command::Sweep { watch: false } => print_json(&sweep_once(&open_service(config)?)),
        Command::Sweep { watch: true } => {
            let service = Arc::new(open_service(config)?);
            tokio::select! {
                _ = run_maintenance(service) => Ok(()),
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received; stopping maintenance loop");
                    Ok(())
                }
            }
        }
        Command::Resume => {
            let service = open_service(config)?;
            let requeued = service.resume_interrupted();
            let resumed = service.resume_pending().await;
            print_json(&serde_json::json!({ "requeued": requeued, "resumed": resumed }))
        }
        Command::Load { kind, file } => load(config, kind, &file).await,
        Command::Collections => print_json(&collection::list_all()),
        Command::Config => print_json(&serde_json::json!({
            "config": config.redacted_summary(),
            "profiles": Config::available_profiles(),
        })),
    }
}

fn open_service(config: &Config) -> Result<IngestService> {
    IngestService::from_config(config).context("failed to open the job store")
}

/// Wait for a job in the foreground; Ctrl-C cancels it.
async fn follow(service: &IngestService, job_id: &str, mut handle: JoinHandle<()>) -> Result<()> {
    info!(job_id = %job_id, "job started; press Ctrl-C to cancel");
    tokio::select! {
        joined = &mut handle => joined.context("job task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %job_id, "interrupt received; cancelling job");
            service.cancel_job(job_id).await;
            handle.await.context("job task panicked")?;
        }
    }
    print_json(&service.get_job(job_id, false)?)
}

async fn jobs(service: &IngestService, command: JobsCommand) -> Result<()> {
    match command {
        JobsCommand::List { page, status, sort_by, order } => {
            let query = JobQuery { page, status, sort_by, order };
            print_json(&service.list_jobs(&query))
        }
        JobsCommand::Show { job_id, detailed } => print_json(&service.get_job(&job_id, detailed)?),
        JobsCommand::Cancel { job_id } => {
            if !service.cancel_job(&job_id).await {
                bail!("job {job_id} was not cancelled: it does not exist or already finished");
            }
            print_json(&service.get_job(&job_id, false)?)
        }
    }
}

async fn load(config: &Config, kind: LoadKind, file: &Path) -> Result<()> {
    ensure!(file.is_file(), "no such file: {}", file.display());

    let loader = Loader::new(config.loader.clone());
    let registry = CancellationRegistry::new(config.ingest.cancel_grace());
    let outcome = loader
        .run(kind, file, &registry, DIRECT_LOAD_ID)
        .await
        .with_context(|| format!("failed to load {}", file.display()))?;

    match outcome {
        LoadOutcome::Success { stdout, .. } => {
            print!("{stdout}");
            Ok(())
        }
        LoadOutcome::Failed { code, stderr } => {
            bail!("loader exited with status {code:?}: {}", stderr.trim())
        }
        LoadOutcome::Terminated => bail!("loader was terminated"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{text}");
    Ok(())
}
