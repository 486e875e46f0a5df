use crate::comment::CommentId;

/// Server-enforced maximum of ids per bulk request and items per response.
pub const BATCH_CAP: usize = 300;

/// A non-empty, ordered run of ids small enough for one bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch(Vec<CommentId>);

impl Batch {
    pub fn ids(&self) -> &[CommentId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `ids` form value: `1,2,3`.
    pub fn to_param(&self) -> String {
        self.0
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Splits `ids` into contiguous batches of at most `cap` ids, keeping order.
pub fn plan(ids: &[CommentId], cap: usize) -> Vec<Batch> {
    ids.chunks(cap.max(1))
        .map(|chunk| Batch(chunk.to_vec()))
        .collect()
}
