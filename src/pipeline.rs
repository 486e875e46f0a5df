use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::comment::{Comment, CommentId};
use crate::config::RetrievalConfig;
use crate::coordinator::{FetchCoordinator, Retrieval, SubtreeBlob};
use crate::error::{Error, ExtractionError, Result};
use crate::expand::ThreadExpander;
use crate::extract;
use crate::fetcher::Transport;
use crate::metrics::{FetchMetrics, millis};
use crate::progress::Progress;
use crate::protocol::{Action, Fragment};

/// A sub-thread folded into a result by expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpandedThread {
    pub story_id: u64,
    pub total: u64,
}

/// Every comment harvested for one thread, plus what could not be harvested.
#[derive(Debug)]
pub struct ThreadResult {
    pub story_id: u64,
    /// Comment count the server reported for `story_id` itself.
    pub total: u64,
    /// No particular order; see [`ThreadResult::sort_by_id`].
    pub comments: Vec<Comment>,
    /// Ids the snapshot named but no response delivered.
    pub missing: Vec<CommentId>,
    /// Ids whose markup was delivered but could not be parsed.
    pub unextractable: Vec<CommentId>,
    pub errors: Vec<Error>,
    pub metrics: FetchMetrics,
    pub expanded: Vec<ExpandedThread>,
}

impl ThreadResult {
    pub fn expected_len(&self) -> u64 {
        self.total + self.expanded.iter().map(|t| t.total).sum::<u64>()
    }

    pub fn is_complete(&self) -> bool {
        self.comments.len() as u64 == self.expected_len()
            && self.missing.is_empty()
            && self.unextractable.is_empty()
    }

    pub fn sort_by_id(&mut self) {
        self.comments.sort_by_key(|c| c.id);
    }

    /// Appends a sub-thread's comments and bookkeeping.
    pub fn absorb(&mut self, sub: ThreadResult) {
        self.comments.extend(sub.comments);
        self.missing.extend(sub.missing);
        self.unextractable.extend(sub.unextractable);
        self.errors.extend(sub.errors);
        self.metrics.merge(&sub.metrics);
        self.expanded.push(ExpandedThread {
            story_id: sub.story_id,
            total: sub.total,
        });
        self.expanded.extend(sub.expanded);
    }
}

pub struct Pipeline {
    coordinator: FetchCoordinator,
    config: RetrievalConfig,
    progress: Option<Arc<Progress>>,
}

impl Pipeline {
    pub fn new(
        config: RetrievalConfig,
        transport: Arc<dyn Transport>,
        progress: Option<Arc<Progress>>,
    ) -> Self {
        Self {
            coordinator: FetchCoordinator::new(transport, config.clone(), progress.clone()),
            config,
            progress,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    /// Harvests `story_id`, following embedded posts when the config asks for it.
    pub async fn retrieve(&self, story_id: u64) -> Result<ThreadResult> {
        let result = self.retrieve_thread(story_id).await?;
        if !self.config.expand_embedded_posts {
            return Ok(result);
        }
        Ok(ThreadExpander::new(self).expand(result).await)
    }

    /// Harvests exactly one thread; embedded posts are left unexpanded.
    pub async fn retrieve_thread(&self, story_id: u64) -> Result<ThreadResult> {
        let retrieval = self.coordinator.fetch_thread(story_id).await?;
        let Retrieval {
            story_id,
            total,
            decoded,
            fragments,
            subtrees,
            mut errors,
            mut metrics,
        } = retrieval;

        if let Some(p) = &self.progress {
            p.set_stage(format!("story {story_id}: extracting"));
        }
        let started = Instant::now();
        let work = fragments
            .into_iter()
            .map(|(_, fragment)| Work::Fragment(fragment))
            .chain(subtrees.into_iter().map(Work::Subtree))
            .collect();
        let workers = self.config.extract_workers();
        let extracted = extract_parallel(work, workers, self.config.batch_cap).await;
        metrics.extract_ms = millis(started.elapsed());

        let mut by_id = BTreeMap::new();
        for comment in extracted.comments {
            by_id.entry(comment.id).or_insert(comment);
        }

        let mut unextractable = BTreeSet::new();
        for (id, source) in extracted.failures {
            if let Some(id) = id.filter(|id| !by_id.contains_key(id)) {
                unextractable.insert(id);
            }
            errors.push(Error::Extraction { id, source });
        }
        errors.extend(extracted.advisories);

        let missing: Vec<CommentId> = decoded
            .into_iter()
            .filter(|id| !by_id.contains_key(id) && !unextractable.contains(id))
            .collect();

        metrics.extracted = by_id.len() as u64;
        let comments: Vec<Comment> = by_id.into_values().collect();

        if comments.len() as u64 != total || !missing.is_empty() {
            tracing::warn!(
                story_id,
                total,
                extracted = comments.len(),
                missing = missing.len(),
                unextractable = unextractable.len(),
                "thread incomplete"
            );
        } else {
            tracing::info!(story_id, total, "thread complete");
        }

        Ok(ThreadResult {
            story_id,
            total,
            comments,
            missing,
            unextractable: unextractable.into_iter().collect(),
            errors,
            metrics,
            expanded: Vec::new(),
        })
    }
}

enum Work {
    Fragment(Fragment),
    Subtree(SubtreeBlob),
}

#[derive(Default)]
struct Extracted {
    comments: Vec<Comment>,
    failures: Vec<(Option<CommentId>, ExtractionError)>,
    advisories: Vec<Error>,
}

impl Extracted {
    fn merge(&mut self, other: Extracted) {
        self.comments.extend(other.comments);
        self.failures.extend(other.failures);
        self.advisories.extend(other.advisories);
    }
}

/// Parses markup on at most `workers` blocking threads, one contiguous chunk
/// each. Chunks return their own output; nothing is shared while they run.
async fn extract_parallel(work: Vec<Work>, workers: usize, cap: usize) -> Extracted {
    let mut out = Extracted::default();
    if work.is_empty() {
        return out;
    }

    let chunk_size = work.len().div_ceil(workers.max(1));
    let mut chunks: Vec<Vec<Work>> = Vec::new();
    let mut work = work.into_iter().peekable();
    while work.peek().is_some() {
        chunks.push(work.by_ref().take(chunk_size).collect());
    }

    let mut set = JoinSet::new();
    for chunk in chunks {
        set.spawn_blocking(move || extract_chunk(chunk, cap));
    }

    // A panicked chunk leaves its ids unextracted, so they surface as missing.
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(extracted) => out.merge(extracted),
            Err(e) => tracing::error!(error = %e, "extraction worker failed"),
        }
    }
    out
}

fn extract_chunk(chunk: Vec<Work>, cap: usize) -> Extracted {
    let mut out = Extracted::default();
    for item in chunk {
        match item {
            Work::Fragment(fragment) => match extract::extract(&fragment.html) {
                Ok(mut comment) => {
                    if comment.id != fragment.id {
                        tracing::warn!(
                            expected = fragment.id,
                            found = comment.id,
                            "fragment id mismatch"
                        );
                    }
                    comment.is_hidden = fragment.is_hidden;
                    comment.is_hidden_children = fragment.is_hidden_children;
                    out.comments.push(comment);
                }
                Err(e) => {
                    tracing::warn!(id = fragment.id, error = %e, "unextractable fragment");
                    out.failures.push((Some(fragment.id), e));
                }
            },
            Work::Subtree(blob) => {
                let entries = extract::extract_all(&blob.html);
                let descendants = entries.iter().filter(|(id, _)| *id != Some(blob.root)).count();
                if descendants >= cap {
                    out.advisories.push(Error::LimitExceeded {
                        action: Action::FetchSubtree,
                        count: descendants,
                        scope: format!("subtree of comment {}", blob.root),
                    });
                }
                for (id, res) in entries {
                    match res {
                        Ok(comment) => out.comments.push(comment),
                        Err(e) => out.failures.push((id, e)),
                    }
                }
            }
        }
    }
    out
}
