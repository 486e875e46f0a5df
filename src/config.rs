use std::time::Duration;

use anyhow::Context as _;
use url::Url;

use crate::batch::BATCH_CAP;
use crate::cli::{Args, Strategy};

pub const DEFAULT_ENDPOINT: &str = "https://pikabu.ru/ajax/comments_actions.php";

pub const DEFAULT_USER_AGENTS: &[&str] = &["Chrome/108.0.0.0", "Mozilla/5.0", "Dalvik/2.1.0"];

/// How the comments not delivered by root pagination are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStrategy {
    /// Decode the snapshot tree and request ids in capped batches.
    ByIds,
    /// Request the full subtree of every root comment that has children.
    Subtrees,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub endpoint: Url,
    /// Constant query pairs the server expects on every request.
    pub extra_query: Vec<(String, String)>,
    /// Rotated round-robin, one per request.
    pub user_agents: Vec<String>,
    pub max_concurrency: usize,
    /// Bounds one HTTP attempt.
    pub request_timeout: Duration,
    /// Bounds one remote call as a whole: permit wait, every attempt and the
    /// backoff sleeps between them.
    pub call_timeout: Duration,
    pub batch_cap: usize,
    pub strategy: RetrievalStrategy,
    pub expand_embedded_posts: bool,
    pub max_expansion_depth: usize,
    /// Extraction workers; `None` uses the available parallelism.
    pub extract_workers: Option<usize>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid url"),
            extra_query: vec![("g".to_string(), "goog".to_string())],
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            max_concurrency: 8,
            request_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(120),
            batch_cap: BATCH_CAP,
            strategy: RetrievalStrategy::ByIds,
            expand_embedded_posts: false,
            max_expansion_depth: 4,
            extract_workers: None,
        }
    }
}

impl RetrievalConfig {
    pub fn extract_workers(&self) -> usize {
        self.extract_workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

impl TryFrom<&Args> for RetrievalConfig {
    type Error = anyhow::Error;

    fn try_from(args: &Args) -> anyhow::Result<Self> {
        let mut extra_query = RetrievalConfig::default().extra_query;
        for pair in &args.query {
            let (key, value) = parse_query_pair(pair)?;
            match extra_query.iter_mut().find(|(k, _)| *k == key) {
                Some(existing) => existing.1 = value,
                None => extra_query.push((key, value)),
            }
        }

        let request_timeout = Duration::from_secs(args.timeout_secs.max(1));

        let user_agents = if args.user_agent.is_empty() {
            RetrievalConfig::default().user_agents
        } else {
            args.user_agent.clone()
        };

        Ok(Self {
            endpoint: args.endpoint.clone(),
            extra_query,
            user_agents,
            max_concurrency: args.max_concurrency.max(1),
            request_timeout,
            call_timeout: Duration::from_secs(args.call_timeout_secs).max(request_timeout),
            batch_cap: args.batch_cap.max(1),
            strategy: match args.strategy {
                Strategy::ByIds => RetrievalStrategy::ByIds,
                Strategy::Subtrees => RetrievalStrategy::Subtrees,
            },
            expand_embedded_posts: args.expand_posts,
            max_expansion_depth: args.max_expansion_depth,
            extract_workers: args.extract_workers,
        })
    }
}

fn parse_query_pair(pair: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = pair
        .split_once('=')
        .with_context(|| format!("query parameter {pair:?} is not key=value"))?;
    if key.is_empty() {
        anyhow::bail!("query parameter {pair:?} has an empty key");
    }
    Ok((key.to_string(), value.to_string()))
}
