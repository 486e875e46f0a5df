use std::collections::BTreeSet;

use serde::Deserialize;

use crate::comment::CommentId;

/// Position inside every tree level that holds a structural flag, not an offset.
const STRUCTURAL_FLAG_INDEX: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Offset(u64),
    Branch(Vec<TreeNode>),
}

/// The server's compact encoding of one thread's comment hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub total: u64,
    pub min_id: CommentId,
    pub tree: Vec<TreeNode>,
}

impl Snapshot {
    pub fn decode_ids(&self) -> Vec<CommentId> {
        decode(&self.tree, self.min_id)
    }
}

/// Lazily walks `tree` and yields absolute comment ids, `min_id` first.
///
/// The walk keeps its own stack of `(level, position)` frames so nesting depth
/// is bounded by heap, not by the call stack. Duplicates are yielded as found.
pub fn decode_iter(tree: &[TreeNode], min_id: CommentId) -> DecodedIds<'_> {
    DecodedIds {
        min_id,
        root_pending: true,
        stack: vec![(tree, 0)],
    }
}

/// All ids of the thread, ascending and without duplicates.
pub fn decode(tree: &[TreeNode], min_id: CommentId) -> Vec<CommentId> {
    decode_iter(tree, min_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub struct DecodedIds<'a> {
    min_id: CommentId,
    root_pending: bool,
    stack: Vec<(&'a [TreeNode], usize)>,
}

impl Iterator for DecodedIds<'_> {
    type Item = CommentId;

    fn next(&mut self) -> Option<CommentId> {
        if self.root_pending {
            self.root_pending = false;
            return Some(self.min_id);
        }

        loop {
            let frame = self.stack.last_mut()?;
            let (level, index) = *frame;
            if index >= level.len() {
                self.stack.pop();
                continue;
            }
            frame.1 += 1;

            match &level[index] {
                TreeNode::Branch(children) => self.stack.push((children.as_slice(), 0)),
                TreeNode::Offset(_) if index == STRUCTURAL_FLAG_INDEX => {}
                // Terminator: no further sibling or child.
                TreeNode::Offset(0) => {}
                TreeNode::Offset(offset) => match self.min_id.checked_add(*offset) {
                    Some(id) => return Some(id),
                    None => tracing::warn!(offset, min_id = self.min_id, "tree offset overflows"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(json: &str) -> Vec<TreeNode> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn decodes_nested_offsets() {
        let t = tree("[[2,0,[[5,0]]]]");
        assert_eq!(decode(&t, 100), vec![100, 102, 105]);
    }

    #[test]
    fn index_one_is_skipped_at_every_level() {
        let t = tree("[[4,9,7],[1,3,[6,8,2]]]");
        // Flags: 9 in the first branch, 3 in the second, 8 in the innermost.
        assert_eq!(decode(&t, 10), vec![10, 11, 12, 14, 16, 17]);
    }

    #[test]
    fn branch_at_index_one_is_descended() {
        let t = tree("[[3,[7,0]]]");
        assert_eq!(decode(&t, 1), vec![1, 4, 8]);
    }

    #[test]
    fn min_id_is_always_present() {
        assert_eq!(decode(&[], 55), vec![55]);
        assert_eq!(decode_iter(&tree("[[2,0]]"), 7).next(), Some(7));
    }

    #[test]
    fn duplicates_are_removed_by_decode_only() {
        let t = tree("[[2,0,[[2,0]]],[2,0]]");
        assert_eq!(decode_iter(&t, 100).collect::<Vec<_>>(), vec![100, 102, 102, 102]);
        assert_eq!(decode(&t, 100), vec![100, 102]);
    }

    #[test]
    fn decoding_is_idempotent() {
        let t = tree("[[9,1,[[3,0,[[4,0]]],[1,0]]],[2,0]]");
        assert_eq!(decode(&t, 1000), decode(&t, 1000));
    }

    #[test]
    fn deep_nesting_does_not_recurse() {
        let mut node = TreeNode::Branch(vec![TreeNode::Offset(1), TreeNode::Offset(0)]);
        for depth in 2..=2000u64 {
            node = TreeNode::Branch(vec![TreeNode::Offset(depth), TreeNode::Offset(0), node]);
        }
        let ids = decode(std::slice::from_ref(&node), 0);
        assert_eq!(ids.len(), 2001);
        assert_eq!(ids.last(), Some(&2000));
    }

    #[test]
    fn negative_offsets_fail_to_deserialize() {
        assert!(serde_json::from_str::<Vec<TreeNode>>("[[-1,0]]").is_err());
    }
}
