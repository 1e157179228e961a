//! Key ordering.

use std::cmp::Ordering;
use std::sync::Arc;

/// Three-way key ordering shared by every sorted structure.
pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Identifies the ordering; tables written under one comparator must be
    /// read under the same one.
    fn name(&self) -> &'static str;
}

/// Lexicographic unsigned byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &'static str {
        "tern.bytewise"
    }
}

pub fn bytewise() -> Arc<dyn Comparator> {
    Arc::new(BytewiseComparator)
}
