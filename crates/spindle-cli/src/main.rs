use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use spindle_core::domain::{NewResult, NewTask, StatusCounts};
use spindle_core::impls::{
    InMemoryTaskStore, QueueExecutor, SqliteTaskStore, WorkContext, WorkHandler, WorkUnit,
};
use spindle_core::{Executor, SchedulerBuilder, SchedulerConfig, SchedulerStats, SpindleError, TaskStore};

const PAGE_TYPE: &str = "demo.page";
const MAX_DEPTH: usize = 2;
const DEFAULT_SEEDS: [&str; 3] = [
    "https://example.test/a",
    "https://example.test/b",
    "https://example.test/c",
];

/// Fails the first `n` calls, then "fetches" pages and follows one link per
/// page until `MAX_DEPTH`.
struct FlakyPageHandler {
    remaining_failures: AtomicU32,
}

impl FlakyPageHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[derive(Debug, Serialize)]
struct PageSummary {
    url: String,
    depth: usize,
}

#[async_trait]
impl WorkHandler for FlakyPageHandler {
    async fn handle(&self, unit: &WorkUnit, ctx: &WorkContext) -> Result<(), SpindleError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(SpindleError::handler(format!(
                "intentional failure (left={left})"
            )));
        }

        let depth = unit.url.matches("/more").count();
        if depth < MAX_DEPTH {
            ctx.enqueue_many(vec![
                NewTask::new(format!("{}/more", unit.url), PAGE_TYPE).with_source(unit.url.clone()),
            ])
            .await?;
        }

        let summary = PageSummary {
            url: unit.url.clone(),
            depth,
        };
        ctx.store_result(NewResult::json(unit.task_id, unit.url.clone(), PAGE_TYPE, &summary)?)
            .await?;
        tracing::info!(task_id = %unit.task_id, url = %unit.url, depth, "page done");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    scheduler: SchedulerStats,
    tasks: StatusCounts,
}

async fn open_store() -> anyhow::Result<Arc<dyn TaskStore>> {
    match std::env::var("SPINDLE_DATABASE") {
        Ok(path) => {
            let store = SqliteTaskStore::open(&path)
                .await
                .with_context(|| format!("opening task store at {path}"))?;
            Ok(Arc::new(store))
        }
        Err(_) => Ok(Arc::new(InMemoryTaskStore::new())),
    }
}

/// One URL per line. Blank lines and `#` comments are skipped.
fn parse_seed_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Seed tasks from `SPINDLE_SEED_FILE` when set, else the built-in list.
async fn seed_tasks() -> anyhow::Result<Vec<NewTask>> {
    let Ok(path) = std::env::var("SPINDLE_SEED_FILE") else {
        return Ok(DEFAULT_SEEDS
            .into_iter()
            .map(|url| NewTask::new(url, PAGE_TYPE).with_source("seed"))
            .collect());
    };

    let contents = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading seed file {path}"))?;
    let source = Path::new(&path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.clone());

    let urls = parse_seed_list(&contents);
    anyhow::ensure!(!urls.is_empty(), "seed file {path} has no URLs");
    Ok(urls
        .into_iter()
        .map(|url| NewTask::new(url, PAGE_TYPE).with_source(source.clone()))
        .collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // (A) 設定と TaskStore を用意
    let config = SchedulerConfig::from_env().context("reading SPINDLE_* configuration")?;
    let store = open_store().await?;

    // (B) 種になるタスクを投入
    let seeds = seed_tasks().await?;
    let inserted = store.add_multiple_tasks(seeds).await?;
    tracing::info!(inserted, "seeded tasks");

    // (C) Executor を登録して Scheduler を組み立てる
    let builder = SchedulerBuilder::new(Arc::clone(&store)).config(config);
    let executor = Arc::new(
        QueueExecutor::new(PAGE_TYPE, FlakyPageHandler::new(2), builder.context())
            .with_concurrency(2),
    );
    let scheduler = builder
        .register(PAGE_TYPE, executor.clone())
        .expect_task_types(&[PAGE_TYPE])
        .build()?;

    // (D) executor ループと scheduler を起動
    let runner = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.start().await })
    };
    scheduler.start().await;

    // (E) executor が捌き切るか Ctrl-C まで待つ
    tokio::select! {
        finished = runner => {
            finished.context("executor loop panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, stopping");
            executor.on_stop("interrupted");
        }
    }
    scheduler.stop().await;
    scheduler.wait_idle().await;

    let summary = RunSummary {
        scheduler: scheduler.stats().await,
        tasks: store.counts_by_status().await?,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
