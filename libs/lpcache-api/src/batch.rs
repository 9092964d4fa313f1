use crate::record::{Offset, Record};

/// Ordered, contiguous run of records handed to a delivery client.
///
/// A batch has no durable identity: it is rebuilt from the store after a
/// restart, starting at the persisted cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    records: Vec<Record>,
    bytes: usize,
}

impl Batch {
    /// Build a batch from records in store order.
    ///
    /// Returns `None` for an empty record list; an empty batch is never
    /// delivered.
    pub fn new(records: Vec<Record>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        debug_assert!(records.windows(2).all(|w| w[0].offset < w[1].offset));
        let bytes = records.iter().map(Record::len).sum();
        Some(Self { records, bytes })
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of line sizes, without separators.
    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    pub fn first_offset(&self) -> Offset {
        self.records[0].offset
    }

    pub fn last_offset(&self) -> Offset {
        self.records[self.records.len() - 1].offset
    }

    /// Cursor candidate: offset immediately following the last record.
    pub fn next_offset(&self) -> Offset {
        self.records[self.records.len() - 1].next_offset()
    }

    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.records.iter().map(|r| r.line.as_slice())
    }

    /// Newline-separated payload, the line protocol wire body.
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.bytes + self.records.len());
        for (i, line) in self.lines().enumerate() {
            if i > 0 {
                body.push(b'\n');
            }
            body.extend_from_slice(line);
        }
        body
    }
}
