use std::collections::{BTreeSet, HashSet};

use async_recursion::async_recursion;

use crate::error::Error;
use crate::pipeline::{Pipeline, ThreadResult};

/// Follows comments that are themselves posts and folds their threads into
/// the result.
pub struct ThreadExpander<'a> {
    pipeline: &'a Pipeline,
    max_depth: usize,
}

impl<'a> ThreadExpander<'a> {
    pub fn new(pipeline: &'a Pipeline) -> Self {
        Self {
            pipeline,
            max_depth: pipeline.config().max_expansion_depth,
        }
    }

    pub async fn expand(&self, result: ThreadResult) -> ThreadResult {
        let mut visited = HashSet::from([result.story_id]);
        self.expand_level(result, &mut visited, 1).await
    }

    #[async_recursion]
    async fn expand_level(
        &self,
        mut result: ThreadResult,
        visited: &mut HashSet<u64>,
        depth: usize,
    ) -> ThreadResult {
        let targets = embedded_targets(&result);
        if depth > self.max_depth {
            if !targets.is_empty() {
                tracing::warn!(
                    story_id = result.story_id,
                    depth,
                    skipped = targets.len(),
                    "embedded posts beyond max expansion depth"
                );
            }
            return result;
        }

        // Only retrieved stories count as visited.
        for story_id in targets {
            if !visited.insert(story_id) {
                tracing::debug!(
                    story_id,
                    parent = result.story_id,
                    "embedded post already harvested"
                );
                continue;
            }

            tracing::info!(story_id, parent = result.story_id, depth, "expanding embedded post");
            match self.pipeline.retrieve_thread(story_id).await {
                Ok(sub) => {
                    let sub = self.expand_level(sub, visited, depth + 1).await;
                    result.absorb(sub);
                }
                Err(e) => {
                    tracing::warn!(story_id, error = %e, "embedded post retrieval failed");
                    result.errors.push(Error::Expansion {
                        story_id,
                        source: Box::new(e),
                    });
                }
            }
        }
        result
    }
}

/// Distinct embedded post ids of a result, its own story excluded.
fn embedded_targets(result: &ThreadResult) -> BTreeSet<u64> {
    result
        .comments
        .iter()
        .filter_map(|c| c.embedded_post_id())
        .filter(|id| *id != result.story_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::RetrievalConfig;
    use crate::protocol::Action;
    use crate::test_support::{
        ScriptedTransport, comment_html, form_value, post_html, story_page_json,
    };

    /// Story 1 links story 2; story 2 links back to 1 and to itself; story 3
    /// links 4; story 4 does not exist.
    fn transport() -> Arc<ScriptedTransport> {
        ScriptedTransport::new(|action, form| {
            assert_eq!(action, Action::ListComments);
            match form_value(form, "story_id") {
                Some("1") => Ok(story_page_json(
                    2,
                    10,
                    "[[1,0]]",
                    &[(10, comment_html(10, 0, 1)), (11, post_html(11, 1, 2))],
                )),
                Some("2") => Ok(story_page_json(
                    3,
                    20,
                    "[[1,0],[2,0]]",
                    &[
                        (20, post_html(20, 2, 1)),
                        (21, post_html(21, 2, 2)),
                        (22, comment_html(22, 0, 2)),
                    ],
                )),
                Some("3") => Ok(story_page_json(1, 30, "[]", &[(30, post_html(30, 3, 4))])),
                _ => Err(Error::network(action, "no such story")),
            }
        })
    }

    fn pipeline(expand: bool) -> (Pipeline, Arc<ScriptedTransport>) {
        let transport = transport();
        let config = RetrievalConfig {
            expand_embedded_posts: expand,
            ..RetrievalConfig::default()
        };
        (Pipeline::new(config, transport.clone(), None), transport)
    }

    #[tokio::test]
    async fn expansion_is_opt_in() {
        let (p, _) = pipeline(false);
        let result = p.retrieve(1).await.unwrap();

        assert_eq!(result.comments.len(), 2);
        let post = result.comments.iter().find(|c| c.id == 11).unwrap();
        assert_eq!(post.embedded_post_id(), Some(2));
        assert!(result.expanded.is_empty());
    }

    #[tokio::test]
    async fn cycles_and_self_links_are_not_followed() {
        let (p, transport) = pipeline(true);
        let mut result = p.retrieve(1).await.unwrap();
        result.sort_by_id();

        assert_eq!(
            result.comments.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![10, 11, 20, 21, 22]
        );
        assert_eq!(result.expanded.len(), 1);
        assert_eq!(result.expected_len(), 5);
        assert!(result.is_complete());
        // One listing per story, nothing repeated.
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn failed_sub_thread_is_recorded() {
        let (p, _) = pipeline(true);
        let result = p.retrieve(3).await.unwrap();

        assert_eq!(result.comments.len(), 1);
        assert!(result.errors.iter().any(|e| matches!(e, Error::Expansion { story_id: 4, .. })));
    }

    #[tokio::test]
    async fn post_seen_past_depth_limit_is_still_expanded_from_shallower_link() {
        // Story 1 links 2 and 3; story 2 links 3 as well.
        let transport = ScriptedTransport::new(|action, form| match form_value(form, "story_id") {
            Some("1") => Ok(story_page_json(
                2,
                10,
                "[[1,0]]",
                &[(10, post_html(10, 1, 2)), (11, post_html(11, 1, 3))],
            )),
            Some("2") => Ok(story_page_json(1, 20, "[]", &[(20, post_html(20, 2, 3))])),
            Some("3") => Ok(story_page_json(1, 30, "[]", &[(30, comment_html(30, 0, 3))])),
            _ => Err(Error::network(action, "no such story")),
        });
        let config = RetrievalConfig {
            expand_embedded_posts: true,
            max_expansion_depth: 1,
            ..RetrievalConfig::default()
        };
        let mut result = Pipeline::new(config, transport, None).retrieve(1).await.unwrap();
        result.sort_by_id();

        let mut expanded: Vec<u64> = result.expanded.iter().map(|t| t.story_id).collect();
        expanded.sort_unstable();
        assert_eq!(expanded, vec![2, 3]);
        assert_eq!(
            result.comments.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![10, 11, 20, 30]
        );
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn depth_limit_stops_expansion() {
        let transport = transport();
        let config = RetrievalConfig {
            expand_embedded_posts: true,
            max_expansion_depth: 0,
            ..RetrievalConfig::default()
        };
        let result = Pipeline::new(config, transport, None).retrieve(1).await.unwrap();
        assert!(result.expanded.is_empty());
    }
}
