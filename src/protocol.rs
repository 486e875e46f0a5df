use std::fmt;

use serde::Deserialize;

use crate::comment::CommentId;
use crate::error::{Error, Result};
use crate::tree::{Snapshot, TreeNode};

/// Remote operations of the comments endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ListComments,
    FetchByIds,
    FetchSubtree,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::ListComments => "get_story_comments",
            Action::FetchByIds => "get_comments_by_ids",
            Action::FetchSubtree => "get_comments_subtree",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Form fields of one request, `action` excluded.
pub type Form = Vec<(&'static str, String)>;

/// One comment's raw markup as the server delivered it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Fragment {
    pub id: CommentId,
    pub html: String,
    #[serde(default, deserialize_with = "flag")]
    pub is_hidden: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub is_hidden_children: Option<bool>,
}

impl Fragment {
    pub fn new(id: CommentId, html: impl Into<String>) -> Self {
        Self {
            id,
            html: html.into(),
            is_hidden: None,
            is_hidden_children: None,
        }
    }
}

/// The server sends listing flags as booleans or as `0`/`1`.
fn flag<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(Option::<Flag>::deserialize(deserializer)?.map(|f| match f {
        Flag::Bool(b) => b,
        Flag::Int(n) => n != 0,
    }))
}

/// The first (or a following) page of root comments.
#[derive(Debug, Clone)]
pub struct StoryPage {
    pub snapshot: Snapshot,
    pub comments: Vec<Fragment>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    result: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct StoryCommentsData {
    total: u64,
    min_id: CommentId,
    tree: Vec<TreeNode>,
    comments: Vec<Fragment>,
}

#[derive(Debug, Deserialize)]
struct SubtreeData {
    html: String,
}

pub fn list_comments_form(story_id: u64, start_after: Option<CommentId>) -> Form {
    let mut form = vec![("story_id", story_id.to_string())];
    if let Some(id) = start_after {
        form.push(("start_comment_id", id.to_string()));
    }
    form
}

pub fn fetch_by_ids_form(ids: String) -> Form {
    vec![("ids", ids)]
}

pub fn fetch_subtree_form(id: CommentId) -> Form {
    vec![("id", id.to_string())]
}

pub fn parse_story_page(body: &[u8]) -> Result<StoryPage> {
    let data: StoryCommentsData = open_envelope(Action::ListComments, body)?;
    Ok(StoryPage {
        snapshot: Snapshot {
            total: data.total,
            min_id: data.min_id,
            tree: data.tree,
        },
        comments: data.comments,
    })
}

pub fn parse_by_ids(body: &[u8]) -> Result<Vec<Fragment>> {
    open_envelope(Action::FetchByIds, body)
}

pub fn parse_subtree(body: &[u8]) -> Result<String> {
    let data: SubtreeData = open_envelope(Action::FetchSubtree, body)?;
    Ok(data.html)
}

fn open_envelope<T: serde::de::DeserializeOwned>(action: Action, body: &[u8]) -> Result<T> {
    let envelope: Envelope<T> = serde_json::from_slice(body)
        .map_err(|e| Error::protocol(action, format!("decode json: {e}")))?;

    if envelope.result == Some(false) {
        let message = envelope.message.unwrap_or_default();
        return Err(Error::protocol(
            action,
            format!("server rejected request: {message}"),
        ));
    }

    envelope
        .data
        .ok_or_else(|| Error::protocol(action, "missing `data` field"))
}
