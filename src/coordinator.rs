use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::stream::{self, StreamExt as _};

use crate::batch::{Batch, plan};
use crate::comment::CommentId;
use crate::config::{RetrievalConfig, RetrievalStrategy};
use crate::error::{Error, Result};
use crate::extract;
use crate::fetcher::Transport;
use crate::metrics::{FetchMetrics, millis};
use crate::progress::Progress;
use crate::protocol::{self, Action, Form, Fragment};
use crate::tree::Snapshot;

/// Snapshot plus every root comment the paginated listing delivered.
#[derive(Debug, Clone)]
pub struct RootListing {
    pub snapshot: Snapshot,
    pub roots: Vec<Fragment>,
    pub pages: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BatchResponse {
    pub fragments: BTreeMap<CommentId, Fragment>,
    /// Items in the response, duplicates included.
    pub items: usize,
    /// The response held exactly the cap worth of items.
    pub possibly_truncated: bool,
}

#[derive(Debug, Clone)]
pub struct SubtreeBlob {
    pub root: CommentId,
    pub html: String,
}

/// Raw material for one thread, before extraction.
#[derive(Debug)]
pub struct Retrieval {
    pub story_id: u64,
    pub total: u64,
    /// Every id the snapshot tree names, ascending.
    pub decoded: Vec<CommentId>,
    pub fragments: BTreeMap<CommentId, Fragment>,
    pub subtrees: Vec<SubtreeBlob>,
    pub errors: Vec<Error>,
    pub metrics: FetchMetrics,
}

pub struct FetchCoordinator {
    transport: Arc<dyn Transport>,
    config: RetrievalConfig,
    progress: Option<Arc<Progress>>,
}

impl FetchCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: RetrievalConfig,
        progress: Option<Arc<Progress>>,
    ) -> Self {
        Self {
            transport,
            config,
            progress,
        }
    }

    /// Walks the root-comment listing page by page. Each request starts after
    /// the last root id of the previous page, so pages are strictly sequential.
    pub async fn fetch(&self, story_id: u64) -> Result<RootListing> {
        let cap = self.cap();
        let first = self.list_page(story_id, None).await?;
        let snapshot = first.snapshot;
        let mut pages = 1u64;

        let mut seen = HashSet::new();
        let mut roots = Vec::new();
        let mut page = first.comments;

        loop {
            let count = page.len();
            let last = page.last().map(|c| c.id);
            let mut added = 0usize;
            for fragment in page {
                if seen.insert(fragment.id) {
                    roots.push(fragment);
                    added += 1;
                }
            }
            tracing::debug!(story_id, page = pages, count, added, "root comments page");

            if count < cap || roots.len() as u64 >= snapshot.total {
                break;
            }
            if added == 0 {
                tracing::warn!(story_id, page = pages, "pagination did not advance; stopping");
                break;
            }
            let Some(last) = last else { break };

            page = self.list_page(story_id, Some(last)).await?.comments;
            pages += 1;
        }

        Ok(RootListing {
            snapshot,
            roots,
            pages,
        })
    }

    /// Requests the markup of up to `cap` comments in one call.
    pub async fn fetch_by_ids(&self, batch: &Batch) -> Result<BatchResponse> {
        let body = self
            .call(Action::FetchByIds, protocol::fetch_by_ids_form(batch.to_param()))
            .await?;
        let items = protocol::parse_by_ids(&body)?;
        let count = items.len();
        Ok(BatchResponse {
            fragments: items.into_iter().map(|f| (f.id, f)).collect(),
            items: count,
            possibly_truncated: count >= self.cap(),
        })
    }

    /// Requests every descendant of one root comment as a single markup blob.
    pub async fn fetch_subtree(&self, root: CommentId) -> Result<SubtreeBlob> {
        let body = self
            .call(Action::FetchSubtree, protocol::fetch_subtree_form(root))
            .await?;
        Ok(SubtreeBlob {
            root,
            html: protocol::parse_subtree(&body)?,
        })
    }

    /// Everything needed to build one thread. Fails only when the snapshot
    /// cannot be obtained; per-request failures are collected in `errors`.
    pub async fn fetch_thread(&self, story_id: u64) -> Result<Retrieval> {
        let started = Instant::now();
        if let Some(p) = &self.progress {
            p.set_stage(format!("story {story_id}: root comments"));
        }

        let listing = self.fetch(story_id).await?;
        let decoded = listing.snapshot.decode_ids();
        tracing::info!(
            story_id,
            total = listing.snapshot.total,
            decoded = decoded.len(),
            roots = listing.roots.len(),
            "snapshot decoded"
        );

        let mut metrics = FetchMetrics {
            requests: listing.pages,
            pages: listing.pages,
            ..FetchMetrics::default()
        };
        let mut errors = Vec::new();
        let mut subtrees = Vec::new();

        let with_children: Vec<CommentId> = listing
            .roots
            .iter()
            .filter(|r| extract::has_children(&r.html))
            .map(|r| r.id)
            .collect();
        let mut fragments: BTreeMap<CommentId, Fragment> =
            listing.roots.into_iter().map(|f| (f.id, f)).collect();

        match self.config.strategy {
            RetrievalStrategy::ByIds => {
                let pending: Vec<CommentId> = decoded
                    .iter()
                    .copied()
                    .filter(|id| !fragments.contains_key(id))
                    .collect();
                let batches = plan(&pending, self.cap());
                if let Some(p) = &self.progress {
                    p.set_stage(format!("story {story_id}: {} batches", batches.len()));
                    p.add_batches(batches.len());
                }

                let outcomes: Vec<(Batch, Result<BatchResponse>)> = stream::iter(batches)
                    .map(|batch| async move {
                        let res = self.fetch_by_ids(&batch).await;
                        (batch, res)
                    })
                    .buffer_unordered(self.config.max_concurrency.max(1))
                    .collect()
                    .await;

                for (batch, res) in outcomes {
                    metrics.requests += 1;
                    metrics.batches += 1;
                    if let Some(p) = &self.progress {
                        p.batch_done(batch.len());
                    }
                    match res {
                        Ok(resp) => {
                            if resp.possibly_truncated {
                                errors.push(Error::LimitExceeded {
                                    action: Action::FetchByIds,
                                    count: resp.items,
                                    scope: describe_batch(&batch),
                                });
                            }
                            for (id, fragment) in resp.fragments {
                                fragments.entry(id).or_insert(fragment);
                            }
                        }
                        Err(e) => {
                            metrics.failed_batches += 1;
                            tracing::warn!(error = %e, ids = batch.len(), "batch failed");
                            errors.push(e);
                        }
                    }
                }
            }
            RetrievalStrategy::Subtrees => {
                if let Some(p) = &self.progress {
                    p.set_stage(format!("story {story_id}: {} subtrees", with_children.len()));
                    p.add_batches(with_children.len());
                }

                let outcomes: Vec<Result<SubtreeBlob>> = stream::iter(with_children)
                    .map(|root| self.fetch_subtree(root))
                    .buffer_unordered(self.config.max_concurrency.max(1))
                    .collect()
                    .await;

                for res in outcomes {
                    metrics.requests += 1;
                    metrics.batches += 1;
                    if let Some(p) = &self.progress {
                        p.batch_done(1);
                    }
                    match res {
                        Ok(blob) => subtrees.push(blob),
                        Err(e) => {
                            metrics.failed_batches += 1;
                            tracing::warn!(error = %e, "subtree failed");
                            errors.push(e);
                        }
                    }
                }
            }
        }

        metrics.fragments = fragments.len() as u64;
        metrics.fetch_ms = millis(started.elapsed());

        Ok(Retrieval {
            story_id,
            total: listing.snapshot.total,
            decoded,
            fragments,
            subtrees,
            errors,
            metrics,
        })
    }

    fn cap(&self) -> usize {
        self.config.batch_cap.max(1)
    }

    async fn list_page(
        &self,
        story_id: u64,
        start_after: Option<CommentId>,
    ) -> Result<protocol::StoryPage> {
        let body = self
            .call(
                Action::ListComments,
                protocol::list_comments_form(story_id, start_after),
            )
            .await?;
        protocol::parse_story_page(&body)
    }

    /// One remote call under the call timeout, retries included. Single
    /// attempts are bounded by the transport. A timed-out call is dropped,
    /// which cancels it.
    async fn call(&self, action: Action, form: Form) -> Result<Bytes> {
        let timeout = self.config.call_timeout;
        match tokio::time::timeout(timeout, self.transport.post_form(action, form)).await {
            Ok(res) => res,
            Err(_) => Err(Error::network(
                action,
                format!("timed out after {}ms", timeout.as_millis()),
            )),
        }
    }
}

fn describe_batch(batch: &Batch) -> String {
    match (batch.ids().first(), batch.ids().last()) {
        (Some(first), Some(last)) => format!("batch {first}..={last} ({} ids)", batch.len()),
        _ => "empty batch".to_string(),
    }
}
