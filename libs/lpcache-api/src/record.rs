/// Position of a record in the cache store.
///
/// Offsets are strictly increasing in append order but not necessarily
/// contiguous: reclaimed or rolled-back appends leave gaps.
pub type Offset = u64;

/// One cached metric line. The consumer never parses the line protocol,
/// it only needs record boundaries and ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: Offset,
    pub line: Vec<u8>,
}

impl Record {
    pub fn new(offset: Offset, line: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            line: line.into(),
        }
    }

    /// Size of the line in bytes, as counted against batch limits.
    pub fn len(&self) -> usize {
        self.line.len()
    }

    pub fn is_empty(&self) -> bool {
        self.line.is_empty()
    }

    /// Offset the cursor moves to once this record is delivered.
    pub fn next_offset(&self) -> Offset {
        self.offset + 1
    }

    /// Lossy text view, for logging only.
    pub fn line_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.line)
    }
}
