#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::too_many_lines)]

mod cli;
mod config;
mod context;
mod error;
mod indexer;
mod job;
mod k8s;
mod measurements;
mod ratelimit;
mod template;
mod workerpool;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::{Args, Command};
use config::Config;
use context::{JobContext, RunContext};
use indexer::{Indexer, LocalFileIndexer};
use job::JobRunner;
use k8s::client::{build_client, current_context};
use k8s::gateway::ApiGateway;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).compact().init();

    let args = Args::parse();
    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(1)
        }
    }
}

/// Returns `Ok(true)` when the command succeeded and every job passed
/// (spec.md §6: "Exit code 0 on pass, 1 on any job failure or verification
/// failure"), `Ok(false)` otherwise.
async fn run(args: Args) -> Result<bool> {
    match args.command {
        Command::Init { config, vars, metrics_dir } => run_init(&config, &vars, &metrics_dir).await,
        Command::Index { metrics_dir } => run_index(&metrics_dir).await.map(|()| true),
        Command::Destroy { run_id } => run_destroy(&run_id).await.map(|()| true),
        Command::Version => {
            println!("kube-loadgen {}", env!("CARGO_PKG_VERSION"));
            Ok(true)
        }
    }
}

async fn run_init(config_path: &std::path::Path, cli_vars: &[String], metrics_dir: &std::path::Path) -> Result<bool> {
    let doc = Config::load(config_path)?;
    let vars = config::parse_cli_vars(cli_vars)?;

    info!(context = %current_context(), "using kubeconfig context");
    let client = build_client().await?;
    let run = RunContext::new();
    let indexer: std::sync::Arc<dyn Indexer> = std::sync::Arc::new(LocalFileIndexer::new(metrics_dir)?);
    let ctx = JobContext::new(client, run.clone(), indexer).with_cli_vars(vars);

    info!(run_id = %run.label_value(), jobs = doc.jobs.len(), "starting run");

    let mut all_passed = true;
    for job in doc.jobs {
        let job_name = job.name.clone();
        info!(job = %job_name, "running job");
        let runner = JobRunner::new(job, ctx.clone(), &doc.global.measurements);
        let summary = runner.run().await;

        info!(
            job = %job_name,
            passed = summary.passed,
            requests_sent = summary.requests_sent,
            observed_qps = summary.observed_qps,
            elapsed_secs = summary.elapsed_secs,
            indexed_documents = summary.indexed_documents,
            "job finished"
        );
        if !summary.execution_errors.is_empty() {
            for e in &summary.execution_errors {
                error!(job = %job_name, "{e}");
            }
        }

        let doc = serde_json::to_value(&summary)?;
        if let Err(e) = ctx.indexer.index(&[doc], "jobSummary").await {
            error!(job = %job_name, error = %e, "failed to index job summary");
        }

        all_passed &= summary.passed;
    }

    Ok(all_passed)
}

async fn run_index(metrics_dir: &std::path::Path) -> Result<()> {
    let reindexed_dir = metrics_dir.join("reindexed");
    let target: std::sync::Arc<dyn Indexer> = std::sync::Arc::new(LocalFileIndexer::new(&reindexed_dir)?);

    for entry in std::fs::read_dir(metrics_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("ndjson") {
            continue;
        }
        let metric_name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("unknown").to_string();
        let raw = std::fs::read_to_string(&path)?;
        let docs: Vec<serde_json::Value> =
            raw.lines().filter(|l| !l.trim().is_empty()).filter_map(|l| serde_json::from_str(l).ok()).collect();

        let summary = target.index(&docs, &metric_name).await?;
        info!(metric = %metric_name, indexed = summary.indexed, errored = summary.errored, "re-indexed");
    }

    Ok(())
}

async fn run_destroy(run_id: &str) -> Result<()> {
    let client = build_client().await?;
    let gateway = ApiGateway::new(client, Duration::from_secs(60));

    let namespaces = gateway.list("v1", "Namespace", &format!("runid={run_id}"), None).await?;
    if namespaces.is_empty() {
        info!(run_id, "no namespaces found for this run");
        return Ok(());
    }

    for ns in namespaces {
        let name = ns.metadata.name.unwrap_or_default();
        info!(namespace = %name, "deleting");
        gateway.delete_namespace(&name, false).await?;
    }

    Ok(())
}
