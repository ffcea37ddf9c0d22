//! Worksharing schedule policy for the SIMT target.

use std::fmt;

use crate::directive::{Clauses, ScheduleKind};

/// Use the coalesced (one iteration per lane, strided by lane count)
/// schedule when the program does not pin a different distribution.
pub fn generate_coalesced_schedule(kind: ScheduleKind, chunk_one: bool, ordered: bool) -> bool {
    !ordered
        && (kind == ScheduleKind::Unknown
            || kind == ScheduleKind::Auto
            || (kind == ScheduleKind::Static && chunk_one))
}

/// A barrier must close the loop even under a static schedule.
pub fn requires_barrier_on_static_schedule(kind: ScheduleKind, ordered: bool) -> bool {
    ordered || kind == ScheduleKind::Dynamic || kind == ScheduleKind::Guided
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub kind: ScheduleKind,
    pub coalesced: bool,
    pub barrier: bool,
}

impl SchedulePolicy {
    pub fn for_clauses(clauses: &Clauses) -> Self {
        let (kind, chunk) = match clauses.schedule {
            Some(s) => (s.kind, s.chunk),
            None => (ScheduleKind::Unknown, None),
        };
        Self {
            kind,
            coalesced: generate_coalesced_schedule(kind, chunk == Some(1), clauses.ordered),
            barrier: requires_barrier_on_static_schedule(kind, clauses.ordered),
        }
    }
}

impl fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "schedule {:?}: {}{}",
            self.kind,
            if self.coalesced { "coalesced" } else { "chunked" },
            if self.barrier { ", closing barrier" } else { "" }
        )
    }
}
