use serde::{Deserialize, Serialize};

/// A source location: file ID + byte offset range.
///
/// Spans come from the front end that produced the directive tree and
/// point into the C/C++ source named by `TranslationUnit::source`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    #[serde(default)]
    pub file_id: u16,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(file_id: u16, start: u32, end: u32) -> Self {
        Self {
            file_id,
            start,
            end,
        }
    }

    pub fn dummy() -> Self {
        Self::default()
    }

    pub fn is_dummy(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    pub fn merge(self, other: Span) -> Span {
        debug_assert_eq!(self.file_id, other.file_id);
        Span {
            file_id: self.file_id,
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// 1-based line number of `start` within `source`.
    pub fn line_in(&self, source: &str) -> u32 {
        let end = (self.start as usize).min(source.len());
        source.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() as u32 + 1
    }
}
