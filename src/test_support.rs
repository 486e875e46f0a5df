use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::comment::CommentId;
use crate::error::Result;
use crate::fetcher::Transport;
use crate::protocol::{Action, Form};

type Handler = Box<dyn Fn(Action, &Form) -> Result<Bytes> + Send + Sync>;

/// In-memory transport answering from a closure and recording every call.
pub(crate) struct ScriptedTransport {
    handler: Handler,
    calls: Mutex<Vec<(Action, Form)>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        handler: impl Fn(Action, &Form) -> Result<Bytes> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<(Action, Form)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_form(&self, action: Action, form: Form) -> Result<Bytes> {
        self.calls.lock().unwrap().push((action, form.clone()));
        (self.handler)(action, &form)
    }
}

pub(crate) fn form_value<'a>(form: &'a Form, key: &str) -> Option<&'a str> {
    form.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
}

pub(crate) fn requested_ids(form: &Form) -> Vec<CommentId> {
    form_value(form, "ids")
        .map(|ids| ids.split(',').filter_map(|id| id.parse().ok()).collect())
        .unwrap_or_default()
}

pub(crate) fn comment_html(id: CommentId, parent: CommentId, story: u64) -> String {
    format!(
        r#"<div class="comment" data-id="{id}" data-meta="pid={parent};aid=1;sid={story};said=2;d=2023-01-01T00:00:00+00:00;de=0;r=1;av=1,0"><div class="comment__user" data-name="user{id}" data-id="1"></div><div class="comment__content"><p>text {id}</p></div></div>"#
    )
}

pub(crate) fn post_html(id: CommentId, story: u64, target: u64) -> String {
    format!(
        r#"<div class="comment comment_comstory" data-id="{id}" data-url="https://example.com/story/linked_{target}" data-meta="pid=0;aid=1;sid={story};said=2;de=0;r=1;av=1,0"><div class="comment__content"><p>post</p></div></div>"#
    )
}

pub(crate) fn story_page_json(
    total: u64,
    min_id: CommentId,
    tree: &str,
    comments: &[(CommentId, String)],
) -> Bytes {
    let tree: serde_json::Value = serde_json::from_str(tree).unwrap();
    let comments: Vec<_> = comments
        .iter()
        .map(|(id, html)| serde_json::json!({ "id": id, "html": html }))
        .collect();
    Bytes::from(
        serde_json::json!({
            "result": true,
            "message": "",
            "data": { "total": total, "min_id": min_id, "tree": tree, "comments": comments },
        })
        .to_string(),
    )
}

pub(crate) fn by_ids_json(items: &[(CommentId, String)]) -> Bytes {
    let data: Vec<_> = items
        .iter()
        .map(|(id, html)| serde_json::json!({ "id": id, "html": html }))
        .collect();
    Bytes::from(serde_json::json!({ "result": true, "data": data }).to_string())
}
