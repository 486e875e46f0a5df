pub mod batch;
mod cli;
pub mod comment;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod expand;
pub mod extract;
pub mod fetcher;
pub mod metrics;
pub mod pipeline;
pub mod progress;
pub mod protocol;
pub mod tree;

#[cfg(test)]
mod test_support;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;

use cli::Args;
use comment::{Comment, CommentId};
use config::RetrievalConfig;
use fetcher::{Fetcher, Transport};
use metrics::FetchMetrics;
use pipeline::{ExpandedThread, Pipeline, ThreadResult};

pub use cli::ProgressMode;
pub use cli::{Args as CliArgs, Strategy};
pub use error::{Error, ExtractionError};

/// What `run` writes: one harvested thread, embedded ones folded in.
#[derive(Debug, Serialize)]
struct Report<'a> {
    story_id: u64,
    total: u64,
    complete: bool,
    comments: &'a [Comment],
    missing: &'a [CommentId],
    unextractable: &'a [CommentId],
    errors: Vec<String>,
    advisories: Vec<String>,
    metrics: &'a FetchMetrics,
    expanded: &'a [ExpandedThread],
}

impl<'a> Report<'a> {
    fn new(result: &'a ThreadResult) -> Self {
        let (advisories, errors): (Vec<&Error>, Vec<&Error>) =
            result.errors.iter().partition(|e| e.is_advisory());
        Self {
            story_id: result.story_id,
            total: result.total,
            complete: result.is_complete(),
            comments: &result.comments,
            missing: &result.missing,
            unextractable: &result.unextractable,
            errors: errors.iter().map(|e| e.to_string()).collect(),
            advisories: advisories.iter().map(|e| e.to_string()).collect(),
            metrics: &result.metrics,
            expanded: &result.expanded,
        }
    }
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    use std::io::IsTerminal as _;

    let progress_enabled = match args.progress {
        ProgressMode::Always => true,
        ProgressMode::Never => false,
        ProgressMode::Auto => std::io::stderr().is_terminal(),
    };
    let config = RetrievalConfig::try_from(&args)?;
    let progress = progress::Progress::new(progress_enabled, config.max_concurrency);
    progress.set_stage(format!("story {}", args.story_id));

    let fetcher = Fetcher::new(&config, Some(progress.clone()))?;
    let transport: Arc<dyn Transport> = Arc::new(fetcher);
    let pipeline = Pipeline::new(config, transport, Some(progress.clone()));

    let res = harvest(&pipeline, &args).await;
    progress.finish();
    res
}

async fn harvest(pipeline: &Pipeline, args: &Args) -> anyhow::Result<()> {
    let mut result = pipeline
        .retrieve(args.story_id)
        .await
        .with_context(|| format!("harvest story {}", args.story_id))?;
    result.sort_by_id();

    tracing::info!(
        story_id = result.story_id,
        comments = result.comments.len(),
        expected = result.expected_len(),
        missing = result.missing.len(),
        errors = result.errors.len(),
        "harvest finished"
    );

    let report = Report::new(&result);
    let json = if args.pretty {
        serde_json::to_vec_pretty(&report)
    } else {
        serde_json::to_vec(&report)
    }
    .context("serialize report")?;

    match &args.out {
        Some(path) => write_report(path, &json),
        None => {
            use std::io::Write as _;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&json).context("write report to stdout")?;
            stdout.write_all(b"\n").context("write report to stdout")?;
            Ok(())
        }
    }
}

fn write_report(path: &Path, json: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))
}
