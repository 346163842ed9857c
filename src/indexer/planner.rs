//! Decides which block range to index next.

use std::{
    cmp,
    fmt::{self, Display, Formatter},
    num::NonZeroU64,
};

/// An inclusive block range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Range {
    pub from: u64,
    pub to: u64,
}

impl Display for Range {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Planner {
    /// No block below this one is ever indexed.
    pub start_block: u64,
    /// Maximum number of blocks per range.
    pub chunk_size: NonZeroU64,
    /// Only index the trailing blocks below the head, skipping anything
    /// older. `None` catches up fully.
    pub safe_block_range: Option<u64>,
}

impl Planner {
    /// Computes the next range to index given the last processed block and
    /// the current head. Returns `None` when there is nothing to do.
    pub fn plan(&self, last_processed: Option<u64>, head: u64) -> Option<Range> {
        let next = match last_processed {
            Some(block) => block.checked_add(1)?,
            None => self.start_block,
        };
        let mut from = cmp::max(self.start_block, next);
        if let Some(window) = self.safe_block_range {
            from = cmp::max(from, head.saturating_sub(window));
        }
        if from > head {
            return None;
        }

        let to = cmp::min(from.saturating_add(self.chunk_size.get() - 1), head);
        Some(Range { from, to })
    }

    /// The number of blocks the trailing window skips when planning from the
    /// specified cursor.
    pub fn skipped(&self, last_processed: Option<u64>, range: Range) -> u64 {
        let next = match last_processed {
            Some(block) => block.saturating_add(1),
            None => self.start_block,
        };
        range.from.saturating_sub(cmp::max(self.start_block, next))
    }
}
