//! Immutable sorted tables built from restart-indexed blocks.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Write Path                            │
//! │  caller → TableBuilder ──→ leaf BlockBuilder (diff keys)     │
//! │                 │                                            │
//! │                 └───────→ index BlockBuilder                 │
//! │                            (last key → leaf end offset)      │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Read Path                            │
//! │  recover_table → Table ─→ TableIter                          │
//! │                              ├─ BlockIter over the index     │
//! │                              └─ DiffIter over one leaf       │
//! │                                  (anchor walk-back on prev)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Invariants
//!
//! - Entries are added in ascending comparator order.
//! - Within a leaf, entry `i` with `i % 16 == 0` carries its full key.
//! - The final block of a table is its index; index values tile the leaf
//!   area exactly.

pub mod block;
pub mod comparator;
pub mod diff;
pub mod error;
pub mod format;
pub mod iterator;
pub mod table;

pub use block::{Block, BlockBuilder, BlockIter};
pub use comparator::{bytewise, BytewiseComparator, Comparator};
pub use diff::{decode_key, encode_key, DiffIter};
pub use error::{Result, SSTableError};
pub use iterator::{collect_backward, collect_forward, KvIterator, VecIterator};
pub use table::{recover_table, Table, TableBuilder, TableIter};
