//! Write batches and the internal value tag.
//!
//! A batch is written to the WAL as one record, so its operations are
//! replayed all or nothing:
//!
//! ```text
//! varint count | { tag:u8 | varint klen | key | [varint vlen | value] } * count
//! ```
//!
//! The same tag prefixes every value stored in skiplists and tables; a
//! deletion is kept as a tag-only value until compaction drops it.

use crate::error::{Error, Result};
use tern_core::codec::{get_length_prefixed_slice, get_varint, put_length_prefixed_slice, put_varint, take};

pub const TAG_DELETION: u8 = 0;
pub const TAG_VALUE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }

    /// The tagged form stored in skiplists and tables.
    pub fn stored_value(&self) -> Vec<u8> {
        match self {
            BatchOp::Put { value, .. } => tag_value(value),
            BatchOp::Delete { .. } => vec![TAG_DELETION],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_varint(&mut buf, self.ops.len() as u64);
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    buf.push(TAG_VALUE);
                    put_length_prefixed_slice(&mut buf, key);
                    put_length_prefixed_slice(&mut buf, value);
                }
                BatchOp::Delete { key } => {
                    buf.push(TAG_DELETION);
                    put_length_prefixed_slice(&mut buf, key);
                }
            }
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let count = get_varint(&mut data)?;
        let mut ops = Vec::new();
        for _ in 0..count {
            let tag = take(&mut data, 1)?[0];
            let key = get_length_prefixed_slice(&mut data)?.to_vec();
            let op = match tag {
                TAG_VALUE => BatchOp::Put {
                    key,
                    value: get_length_prefixed_slice(&mut data)?.to_vec(),
                },
                TAG_DELETION => BatchOp::Delete { key },
                other => {
                    return Err(Error::Corruption(format!("unknown batch op tag {}", other)));
                }
            };
            ops.push(op);
        }
        if !data.is_empty() {
            return Err(Error::Corruption(format!(
                "{} trailing bytes after write batch",
                data.len()
            )));
        }
        Ok(Self { ops })
    }
}

pub fn tag_value(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.push(TAG_VALUE);
    out.extend_from_slice(value);
    out
}

/// Splits a stored value into its user value; `None` for a deletion.
pub fn untag(stored: &[u8]) -> Result<Option<&[u8]>> {
    match stored.split_first() {
        Some((&TAG_VALUE, value)) => Ok(Some(value)),
        Some((&TAG_DELETION, _)) => Ok(None),
        Some((tag, _)) => Err(Error::Corruption(format!("unknown value tag {}", tag))),
        None => Err(Error::Corruption("empty stored value".to_string())),
    }
}

pub fn is_deletion(stored: &[u8]) -> bool {
    stored.first() == Some(&TAG_DELETION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_roundtrip_mixed_ops() {
        let mut batch = WriteBatch::new();
        batch.put("a", "1").delete("b").put("c", Vec::<u8>::new());
        let decoded = WriteBatch::decode(&batch.encode()).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.ops()[1].key(), b"b");
    }

    #[test]
    fn test_decode_rejects_truncation_and_garbage() {
        let mut batch = WriteBatch::new();
        batch.put("key", "value");
        let encoded = batch.encode();
        assert!(matches!(
            WriteBatch::decode(&encoded[..encoded.len() - 1]),
            Err(Error::Corruption(_))
        ));

        let mut trailing = encoded.clone();
        trailing.push(0);
        assert!(matches!(WriteBatch::decode(&trailing), Err(Error::Corruption(_))));

        assert!(matches!(WriteBatch::decode(&[1, 9, 0]), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_value_tags() {
        let put = BatchOp::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        let del = BatchOp::Delete { key: b"k".to_vec() };
        assert_eq!(untag(&put.stored_value()).unwrap(), Some(&b"v"[..]));
        assert_eq!(untag(&del.stored_value()).unwrap(), None);
        assert!(is_deletion(&del.stored_value()));
        assert!(untag(&[]).is_err());
        assert!(untag(&[7]).is_err());
    }
}
