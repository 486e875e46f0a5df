use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

pub type CommentId = u64;

/// A `data-meta` value: an integer when it coerces, otherwise the original text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MetaValue {
    Int(i64),
    Raw(String),
}

impl MetaValue {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(v) => MetaValue::Int(v),
            Err(_) => MetaValue::Raw(raw.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(v) => Some(*v),
            MetaValue::Raw(_) => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Int(v) => write!(f, "{v}"),
            MetaValue::Raw(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Author {
    pub name: Option<String>,
    pub id: Option<u64>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Content {
    pub text: String,
    pub images: Vec<String>,
    pub animated_loops: Vec<String>,
    pub videos: Vec<String>,
}

/// Link to the full thread a comment-as-post opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddedPost {
    pub url: String,
    /// `None` when the URL carries no usable numeric suffix.
    pub id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub parent_id: Option<MetaValue>,
    pub author: Author,
    pub story_id: Option<MetaValue>,
    pub story_author_id: Option<MetaValue>,
    pub published_at: Option<String>,
    pub is_deleted: bool,
    /// `None` means the server did not report votes for this comment.
    pub rating_total: Option<MetaValue>,
    pub votes_up: Option<MetaValue>,
    pub votes_down: Option<MetaValue>,
    pub content: Content,
    pub embedded_post: Option<EmbeddedPost>,
    pub has_children: bool,
    /// Listing flags that travel next to the markup, not inside it.
    pub is_hidden: Option<bool>,
    pub is_hidden_children: Option<bool>,
    pub extra_meta: BTreeMap<String, MetaValue>,
}

impl Comment {
    pub fn is_root(&self) -> bool {
        matches!(self.parent_id, Some(MetaValue::Int(0)))
    }

    /// Id of the thread this comment opens, if it is an embedded post.
    pub fn embedded_post_id(&self) -> Option<u64> {
        self.embedded_post
            .as_ref()
            .and_then(|post| post.id)
            .filter(|id| *id != 0)
    }
}
