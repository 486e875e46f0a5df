use std::collections::BTreeMap;
use std::sync::LazyLock;

use kuchiki::iter::NodeEdge;
use kuchiki::traits::TendrilSink as _;
use kuchiki::{ElementData, NodeDataRef, NodeRef};
use regex::Regex;

use crate::comment::{Author, Comment, CommentId, Content, EmbeddedPost, MetaValue};
use crate::error::ExtractionError;

const CONTAINER_SELECTOR: &str = "div.comment";
const CONTAINER_CLASS: &str = "comment";
const CHILDREN_CLASS: &str = "comment__children";
const USER_CLASS: &str = "comment__user";
const CONTENT_CLASS: &str = "comment__content";
const POST_CLASS: &str = "comment_comstory";
const TOGGLE_CHILDREN_CLASS: &str = "comment-toggle-children";
const PLAYER_CLASS: &str = "player";

/// Duration overlays the video player leaves in the text, e.g. `1:05` or `1:02:33`.
static VIDEO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d{1,2}:)?\d{1,2}:\d{2}$").expect("video timestamp regex")
});

/// Parses one comment fragment. The first comment container in document order
/// is the comment; any containers nested inside it are its replies and are
/// never read.
pub fn extract(fragment: &str) -> Result<Comment, ExtractionError> {
    let document = kuchiki::parse_html().one(fragment);
    let root = document
        .select_first(CONTAINER_SELECTOR)
        .map_err(|_| ExtractionError::MissingContainer)?;
    extract_container(&root)
}

/// Extracts every comment container of a subtree blob independently.
///
/// Each entry carries the container's `data-id` when it could be read, so a
/// failure can still be attributed.
pub fn extract_all(blob: &str) -> Vec<(Option<CommentId>, Result<Comment, ExtractionError>)> {
    let document = kuchiki::parse_html().one(blob);
    let Ok(containers) = document.select(CONTAINER_SELECTOR) else {
        return Vec::new();
    };
    containers
        .map(|container| {
            let id = container
                .attributes
                .borrow()
                .get("data-id")
                .and_then(|v| v.trim().parse().ok());
            (id, extract_container(&container))
        })
        .collect()
}

/// Whether the fragment's own comment carries the "toggle children" control.
/// Markers on replies nested in the fragment do not count.
pub fn has_children(fragment: &str) -> bool {
    let document = kuchiki::parse_html().one(fragment);
    document
        .select_first(CONTAINER_SELECTOR)
        .map(|root| own_has_children(&own_elements(root.as_node())))
        .unwrap_or(false)
}

fn own_has_children(own: &[NodeRef]) -> bool {
    own.iter().any(|n| has_class(n, TOGGLE_CHILDREN_CLASS))
}

fn extract_container(root: &NodeDataRef<ElementData>) -> Result<Comment, ExtractionError> {
    let (id, meta_raw, avatar) = {
        let attrs = root.attributes.borrow();
        let raw_id = attrs.get("data-id").unwrap_or("");
        let id: CommentId = raw_id
            .trim()
            .parse()
            .map_err(|_| ExtractionError::InvalidId(raw_id.to_string()))?;
        let meta = attrs
            .get("data-meta")
            .ok_or(ExtractionError::MissingMeta)?
            .to_string();
        let avatar = attrs.get("data-author-avatar").map(str::to_string);
        (id, meta, avatar)
    };

    let meta = parse_meta(&meta_raw);
    let own = own_elements(root.as_node());

    let mut author = own
        .iter()
        .find(|n| has_class(n, USER_CLASS))
        .map(read_author)
        .unwrap_or_default();
    if author.id.is_none() {
        author.id = meta
            .author_id
            .as_ref()
            .and_then(MetaValue::as_int)
            .and_then(|v| u64::try_from(v).ok());
    }
    author.avatar = avatar;

    let content = own
        .iter()
        .find(|n| has_class(n, CONTENT_CLASS))
        .map(read_content)
        .unwrap_or_default();

    let embedded_post = own
        .iter()
        .find(|n| has_class(n, POST_CLASS))
        .and_then(|n| attr(n, "data-url"))
        .map(|url| EmbeddedPost {
            id: post_id_from_url(&url),
            url,
        });

    let has_children = own_has_children(&own);

    Ok(Comment {
        id,
        parent_id: meta.parent_id,
        author,
        story_id: meta.story_id,
        story_author_id: meta.story_author_id,
        published_at: meta.published_at,
        is_deleted: meta.is_deleted,
        rating_total: meta.rating_total,
        votes_up: meta.votes_up,
        votes_down: meta.votes_down,
        content,
        embedded_post,
        has_children,
        is_hidden: None,
        is_hidden_children: None,
        extra_meta: meta.extra,
    })
}

/// Fields of the `data-meta` attribute, e.g.
/// `pid=0;aid=7;sid=9;said=3;d=2023-01-01T00:00:00+00:00;de=0;ic=0;r=5;av=6,1`.
#[derive(Debug, Default, PartialEq, Eq)]
struct Meta {
    parent_id: Option<MetaValue>,
    author_id: Option<MetaValue>,
    story_id: Option<MetaValue>,
    story_author_id: Option<MetaValue>,
    published_at: Option<String>,
    is_deleted: bool,
    rating_total: Option<MetaValue>,
    votes_up: Option<MetaValue>,
    votes_down: Option<MetaValue>,
    extra: BTreeMap<String, MetaValue>,
}

fn parse_meta(raw: &str) -> Meta {
    let mut meta = Meta::default();
    let mut rating = None;
    let mut votes = None;

    for (key, value) in raw.split(';').filter_map(|pair| pair.split_once('=')) {
        let key = key.trim();
        match key {
            "pid" => meta.parent_id = Some(MetaValue::parse(value)),
            "aid" => meta.author_id = Some(MetaValue::parse(value)),
            "sid" => meta.story_id = Some(MetaValue::parse(value)),
            "said" => meta.story_author_id = Some(MetaValue::parse(value)),
            "d" => meta.published_at = Some(value.to_string()),
            "de" => meta.is_deleted = MetaValue::parse(value).as_int().is_some_and(|v| v != 0),
            "r" => rating = Some(MetaValue::parse(value)),
            "av" => votes = value.split_once(','),
            _ => {
                meta.extra.insert(key.to_string(), MetaValue::parse(value));
            }
        }
    }

    // Without the vote split the rating is not trustworthy either.
    if let Some((up, down)) = votes {
        meta.rating_total = rating;
        meta.votes_up = Some(MetaValue::parse(up));
        meta.votes_down = Some(MetaValue::parse(down));
    }
    meta
}

/// Elements belonging to `root` itself, in document order, `root` first.
/// Reply containers and the children wrapper are pruned, never detached.
fn own_elements(root: &NodeRef) -> Vec<NodeRef> {
    let mut out = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(node) = stack.pop() {
        if node.as_element().is_none() {
            continue;
        }
        let nested = has_class(&node, CONTAINER_CLASS) || has_class(&node, CHILDREN_CLASS);
        if node != *root && nested {
            continue;
        }
        let children: Vec<NodeRef> = node.children().collect();
        stack.extend(children.into_iter().rev());
        out.push(node);
    }
    out
}

fn read_author(user: &NodeRef) -> Author {
    Author {
        name: attr(user, "data-name"),
        id: attr(user, "data-id").and_then(|v| v.trim().parse().ok()),
        avatar: None,
    }
}

fn read_content(content: &NodeRef) -> Content {
    let mut images = Vec::new();
    if let Ok(nodes) = content.select("img") {
        for img in nodes {
            let node = img.as_node();
            if inside_player(node) || is_preview(node) {
                continue;
            }
            let attrs = img.attributes.borrow();
            let src = attrs
                .get("data-large-image")
                .or_else(|| attrs.get("data-src"))
                .or_else(|| attrs.get("src"));
            if let Some(src) = src {
                push_media_url(&mut images, src);
            }
        }
    }

    let mut animated_loops = Vec::new();
    if let Ok(players) = content.select(r#"[data-type="gifx"]"#) {
        for player in players {
            let before = animated_loops.len();
            if let Ok(sources) = player.as_node().select("source[src]") {
                for source in sources {
                    if let Some(src) = source.attributes.borrow().get("src") {
                        push_media_url(&mut animated_loops, src);
                    }
                }
            }
            if animated_loops.len() == before {
                if let Some(src) = attr(player.as_node(), "data-source") {
                    push_media_url(&mut animated_loops, &src);
                }
            }
        }
    }

    let mut videos = Vec::new();
    if let Ok(players) = content.select(r#"[data-type="video"]"#) {
        for player in players {
            let node = player.as_node();
            if let Some(src) = attr(node, "data-source").or_else(|| attr(node, "href")) {
                push_media_url(&mut videos, &src);
            }
        }
    }

    Content {
        text: content_text(content),
        images,
        animated_loops,
        videos,
    }
}

fn content_text(content: &NodeRef) -> String {
    let mut raw = String::new();
    for edge in content.traverse() {
        match edge {
            NodeEdge::Start(node) => {
                if let Some(text) = node.as_text() {
                    if !inside_script(&node) {
                        raw.push_str(&text.borrow());
                    }
                } else if let Some(element) = node.as_element() {
                    if is_block(&element.name.local) {
                        raw.push('\n');
                    }
                }
            }
            NodeEdge::End(node) => {
                if let Some(element) = node.as_element() {
                    if is_block(&element.name.local) {
                        raw.push('\n');
                    }
                }
            }
        }
    }

    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty() && !VIDEO_TIMESTAMP.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_block(name: &str) -> bool {
    matches!(
        name,
        "p"
            | "div"
            | "br"
            | "li"
            | "ul"
            | "ol"
            | "blockquote"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "figure"
    )
}

fn inside_script(node: &NodeRef) -> bool {
    node.parent()
        .and_then(|p| p.as_element().map(|e| matches!(&*e.name.local, "script" | "style")))
        .unwrap_or(false)
}

fn inside_player(node: &NodeRef) -> bool {
    node.ancestors().any(|a| has_class(&a, PLAYER_CLASS))
}

fn is_preview(node: &NodeRef) -> bool {
    attr(node, "class")
        .map(|c| {
            let c = c.to_ascii_lowercase();
            c.contains("preview") || c.contains("thumb")
        })
        .unwrap_or(false)
}

fn push_media_url(list: &mut Vec<String>, url: &str) {
    let url = url.trim();
    if url.is_empty() || url.starts_with("data:") {
        return;
    }
    if !list.iter().any(|u| u == url) {
        list.push(url.to_string());
    }
}

/// `https://example.com/story/some_title_10085566` → `10085566`.
fn post_id_from_url(url: &str) -> Option<u64> {
    let path = url.split(['?', '#']).next().unwrap_or(url).trim_end_matches('/');
    let (_, suffix) = path.rsplit_once('_')?;
    suffix.parse::<u64>().ok().filter(|id| *id != 0)
}

fn has_class(node: &NodeRef, class: &str) -> bool {
    node.as_element()
        .map(|e| {
            e.attributes
                .borrow()
                .get("class")
                .map(|c| c.split_ascii_whitespace().any(|t| t == class))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

fn attr(node: &NodeRef, name: &str) -> Option<String> {
    node.as_element()
        .and_then(|e| e.attributes.borrow().get(name).map(str::to_string))
}
