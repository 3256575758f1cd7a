//! Command-line entry points: an all-in-one kernel (`serve`, `demo`) plus
//! read-only status inspection. The HTTP front-end is a separate layer; it
//! embeds [`crate::core::pipeline::Kernel`] directly.

pub mod terminal;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use console::style;
use tokio::sync::watch;

use crate::config::Settings;
use crate::core::broker::InMemoryBroker;
use crate::core::diagram::{DiagramRenderer, PlantUmlRenderer};
use crate::core::llm::OpenAiGateway;
use crate::core::pipeline::Kernel;
use crate::core::recorder::{StatusRecorder, StatusTopic};
use crate::core::stages::{AnswerMap, StageContext};
use crate::core::status::StatusStore;
use crate::core::storage::{FsObjectStore, JobPaths, ObjectStore};
use crate::core::worker::WorkerPool;

fn print_help() {
    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("docwriter").green()
    );
    terminal::GuideSection::new("Kernel")
        .command("serve", "Run all stage workers and the status recorder")
        .command("demo", "Admit a job and drive it to the final artifacts")
        .print();
    terminal::GuideSection::new("Inspection")
        .command("status", "Show a job's current stage (--owner, --job)")
        .command("timeline", "Show a job's event timeline (--owner, --job)")
        .command("list", "List an owner's documents (--owner)")
        .print();
    println!();
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

pub async fn run_main() -> Result<()> {
    crate::logging::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");
    match command {
        "serve" => serve().await,
        "demo" => demo(&args[1..]).await,
        "status" => show_status(&args[1..]).await,
        "timeline" => show_timeline(&args[1..]).await,
        "list" => list_documents(&args[1..]).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_help();
            bail!("unknown command: {other}");
        }
    }
}

/// Wire the kernel's components from settings.
pub fn build_context(settings: Settings) -> Result<Arc<StageContext>> {
    let gateway =
        OpenAiGateway::new(&settings).map_err(|e| anyhow!("llm gateway unavailable: {e}"))?;
    let renderer: Option<Arc<dyn DiagramRenderer>> =
        settings.plantuml_server_url.as_deref().map(|url| {
            Arc::new(PlantUmlRenderer::new(url, settings.max_transient_retries))
                as Arc<dyn DiagramRenderer>
        });
    let status = StatusStore::open(&settings.status_db_path)?;
    let broker = InMemoryBroker::new(settings.max_delivery_count);
    let store = FsObjectStore::new(settings.store_root.clone());
    Ok(Arc::new(StageContext {
        settings: Arc::new(settings),
        broker,
        store: Arc::new(store),
        status: Arc::new(status),
        topic: StatusTopic::new(),
        gateway: Arc::new(gateway),
        renderer,
        converter: None,
    }))
}

async fn serve() -> Result<()> {
    let ctx = build_context(Settings::from_env())?;
    let recorder = StatusRecorder::new(ctx.status.clone(), ctx.settings.timeline_cap);
    let recorder_handle = recorder.spawn(&ctx.topic);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = WorkerPool::new(ctx.clone()).spawn_all(shutdown_rx);
    terminal::print_step("docwriter kernel running; ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    recorder_handle.abort();
    Ok(())
}

async fn demo(args: &[String]) -> Result<()> {
    let title = flag_value(args, "--title").context("--title is required")?;
    let audience = flag_value(args, "--audience").unwrap_or_else(|| "General audience".into());
    let owner = flag_value(args, "--owner").unwrap_or_else(|| "local".into());
    let cycles: u32 = flag_value(args, "--cycles")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let answers_file = flag_value(args, "--answers");

    let ctx = build_context(Settings::from_env())?;
    let recorder = StatusRecorder::new(ctx.status.clone(), ctx.settings.timeline_cap);
    let recorder_handle = recorder.spawn(&ctx.topic);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = WorkerPool::new(ctx.clone()).spawn_all(shutdown_rx);
    let kernel = Kernel::new(ctx.clone());

    let job_id = kernel.admit_job(&owner, &title, &audience, cycles).await?;
    terminal::print_step(&format!("admitted job {job_id}"));

    wait_for_stage(&kernel, &owner, &job_id, "INTAKE_READY").await?;
    let answers = load_answers(ctx.store.as_ref(), &owner, &job_id, answers_file).await?;
    kernel.submit_answers(&owner, &job_id, &answers).await?;
    terminal::print_info("answers submitted, pipeline resumed");

    wait_for_stage(&kernel, &owner, &job_id, "FINALIZE_DONE").await?;
    let paths = JobPaths::new(&owner, &job_id);
    terminal::print_step("final artifacts:");
    for ext in ["md", "pdf", "docx"] {
        let blob = paths.final_artifact(ext);
        if ctx.store.exists(&blob).await.unwrap_or(false) {
            println!("   {blob}");
        }
    }
    println!("   {}", paths.diagram_archive());

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    recorder_handle.abort();
    Ok(())
}

/// Poll the status row until the job reaches `target` or fails.
async fn wait_for_stage(kernel: &Kernel, owner: &str, job_id: &str, target: &str) -> Result<()> {
    loop {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = kernel.get_status(owner, job_id).await?;
        if status.stage == target {
            return Ok(());
        }
        if status.has_error {
            bail!(
                "job {job_id} failed in {}: {}",
                status.stage,
                status.last_error.unwrap_or_default()
            );
        }
    }
}

/// Answers from `--answers <file>`, falling back to the questionnaire's
/// sample answers.
async fn load_answers(
    store: &dyn ObjectStore,
    owner: &str,
    job_id: &str,
    answers_file: Option<String>,
) -> Result<AnswerMap> {
    if let Some(file) = answers_file {
        let text = tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("reading {file}"))?;
        return serde_json::from_str(&text).with_context(|| format!("parsing {file}"));
    }
    let paths = JobPaths::new(owner, job_id);
    let samples: HashMap<String, String> = store
        .get_json(&paths.intake("sample_answers.json"))
        .await
        .unwrap_or_default();
    Ok(samples.into_iter().collect())
}

async fn open_status_store() -> Result<StatusStore> {
    let settings = Settings::from_env();
    StatusStore::open(&settings.status_db_path)
}

async fn show_status(args: &[String]) -> Result<()> {
    let owner = flag_value(args, "--owner").context("--owner is required")?;
    let job = flag_value(args, "--job").context("--job is required")?;
    let store = open_status_store().await?;
    match store.job(&owner, &job).await? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => bail!("job {job} not found for owner {owner}"),
    }
}

async fn show_timeline(args: &[String]) -> Result<()> {
    let owner = flag_value(args, "--owner").context("--owner is required")?;
    let job = flag_value(args, "--job").context("--job is required")?;
    let store = open_status_store().await?;
    for event in store.timeline(&owner, &job).await? {
        let cycle = event
            .cycle
            .map(|c| format!(" (cycle {c})"))
            .unwrap_or_default();
        println!(
            "{:>14.3}  {:<22}{}  {}",
            event.ts,
            event.stage,
            cycle,
            event.message.unwrap_or_default()
        );
    }
    Ok(())
}

async fn list_documents(args: &[String]) -> Result<()> {
    let owner = flag_value(args, "--owner").context("--owner is required")?;
    let store = open_status_store().await?;
    for record in store.list_documents(&owner).await? {
        println!(
            "{}  {:<28} {:<16} cycles {}/{}",
            record.job_id,
            record.title,
            record.stage,
            record.cycles_completed,
            record.cycles_requested
        );
    }
    Ok(())
}
