use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use url::Url;

use crate::config::DEFAULT_ENDPOINT;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Strategy {
    /// Decode the comment tree and fetch ids in capped batches.
    ByIds,
    /// Fetch the whole subtree of each root comment.
    Subtrees,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProgressMode {
    /// Enable progress UI when stderr is a TTY.
    Auto,
    /// Always enable progress UI (even when piped).
    Always,
    /// Never show progress UI.
    Never,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Id of the story whose comment thread is harvested.
    pub story_id: u64,

    /// Comments endpoint that answers the `get_story_comments` family of actions.
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: Url,

    /// Extra `key=value` query parameter sent with every request (repeatable).
    /// Added to `g=goog`; repeating a key overrides its value.
    #[arg(long)]
    pub query: Vec<String>,

    /// User-Agent to rotate through (repeatable). Defaults to a small built-in list.
    #[arg(long)]
    pub user_agent: Vec<String>,

    /// Max concurrent requests during bulk retrieval.
    #[arg(long, default_value_t = 8)]
    pub max_concurrency: usize,

    /// Timeout of a single HTTP attempt, in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Timeout of one remote call including throttling retries, in seconds.
    #[arg(long, default_value_t = 120)]
    pub call_timeout_secs: u64,

    /// Max ids per bulk request (the server refuses more than 300).
    #[arg(long, default_value_t = crate::batch::BATCH_CAP)]
    pub batch_cap: usize,

    /// How to fetch non-root comments.
    #[arg(long, value_enum, default_value = "by-ids")]
    pub strategy: Strategy,

    /// Also harvest the threads of comments that are themselves posts.
    #[arg(long)]
    pub expand_posts: bool,

    /// How many levels of embedded posts to follow with `--expand-posts`.
    #[arg(long, default_value_t = 4)]
    pub max_expansion_depth: usize,

    /// Markup extraction workers (defaults to the number of CPUs).
    #[arg(long)]
    pub extract_workers: Option<usize>,

    /// Write the JSON report here instead of stdout.
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Pretty-print the JSON report.
    #[arg(long)]
    pub pretty: bool,

    /// Progress display: `auto`, `always`, or `never`.
    #[arg(long, value_enum, default_value = "auto")]
    pub progress: ProgressMode,
}
