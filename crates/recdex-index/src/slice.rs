//! `start:stop:step` slice arithmetic over positional record indices.
//!
//! [`IndexSlice`] is the caller-facing `start:stop:step` triple with optional
//! bounds; [`SliceRange`] is its resolution against a concrete length, and
//! composes with further slices without touching any stream.

use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use recdex_error::{RecdexError, Result};

/// An unresolved `start:stop:step` slice. `None` bounds take the natural
/// defaults for the sign of `step`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSlice {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl IndexSlice {
    /// `[:]`
    pub const FULL: Self = Self {
        start: None,
        stop: None,
        step: None,
    };

    #[must_use]
    pub const fn new(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Self {
        Self { start, stop, step }
    }

    /// `[::step]`
    #[must_use]
    pub const fn step_by(step: i64) -> Self {
        Self::new(None, None, Some(step))
    }

    #[must_use]
    pub const fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    /// Clip the slice against a sequence of `len` items, returning the
    /// concrete `(start, stop, step)`.
    pub fn indices(&self, len: u64) -> Result<(i64, i64, i64)> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(RecdexError::invalid_argument("slice step cannot be zero"));
        }
        let len = i64::try_from(len)
            .map_err(|_| RecdexError::invalid_argument(format!("length {len} is too large")))?;
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
        let clip = |bound: i64| {
            if bound < 0 {
                (bound + len).max(lower)
            } else {
                bound.min(upper)
            }
        };
        let start = self.start.map_or(if step < 0 { upper } else { lower }, clip);
        let stop = self.stop.map_or(if step < 0 { lower } else { upper }, clip);
        Ok((start, stop, step))
    }

    /// Resolve against a sequence of `len` items.
    pub fn resolve(&self, len: u64) -> Result<SliceRange> {
        let (start, stop, step) = self.indices(len)?;
        Ok(SliceRange::reduced(start, step, slice_length(start, stop, step)))
    }
}

fn slice_length(start: i64, stop: i64, step: i64) -> u64 {
    let span = if step > 0 { stop - start } else { start - stop };
    if span <= 0 {
        return 0;
    }
    (span - 1).unsigned_abs() / step.unsigned_abs() + 1
}

impl From<RangeFull> for IndexSlice {
    fn from(_: RangeFull) -> Self {
        Self::FULL
    }
}

impl From<Range<i64>> for IndexSlice {
    fn from(range: Range<i64>) -> Self {
        Self::new(Some(range.start), Some(range.end), None)
    }
}

impl From<RangeFrom<i64>> for IndexSlice {
    fn from(range: RangeFrom<i64>) -> Self {
        Self::new(Some(range.start), None, None)
    }
}

impl From<RangeTo<i64>> for IndexSlice {
    fn from(range: RangeTo<i64>) -> Self {
        Self::new(None, Some(range.end), None)
    }
}

/// A slice resolved against a concrete length: `len` positions starting at
/// `start`, `step` apart. Every position is inside the sequence that was sliced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    start: i64,
    step: i64,
    len: u64,
}

impl SliceRange {
    /// A range of `len` positions; ranges of at most one position get a
    /// unit step so that no step wider than the sequence is carried along.
    const fn reduced(start: i64, step: i64, len: u64) -> Self {
        match len {
            0 => Self {
                start: 0,
                step: 1,
                len,
            },
            1 => Self {
                start,
                step: 1,
                len,
            },
            _ => Self { start, step, len },
        }
    }

    /// Every position of a sequence of `len` items, in order.
    #[must_use]
    pub const fn full(len: u64) -> Self {
        Self {
            start: 0,
            step: 1,
            len,
        }
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn step(&self) -> i64 {
        self.step
    }

    /// First position, if any.
    #[must_use]
    pub const fn first(&self) -> Option<u64> {
        if self.len == 0 {
            None
        } else {
            Some(self.start as u64)
        }
    }

    /// Unit-step ranges map onto one contiguous span of the stream.
    #[must_use]
    pub const fn is_contiguous(&self) -> bool {
        self.step == 1
    }

    /// The `n`th position of this range.
    #[must_use]
    pub const fn get(&self, n: u64) -> Option<u64> {
        if n >= self.len {
            return None;
        }
        Some((self.start + n as i64 * self.step) as u64)
    }

    /// Apply `outer` on top of this range, as if slicing the sequence this
    /// range selects.
    pub fn slice(&self, outer: &IndexSlice) -> Result<Self> {
        let (start, stop, step) = outer.indices(self.len)?;
        let len = slice_length(start, stop, step);
        if len == 0 {
            return Ok(Self::reduced(0, 1, 0));
        }
        // With two or more positions both products are distances between
        // positions of the sliced sequence.
        let first = self.start + start * self.step;
        let step = if len > 1 {
            self.step
                .checked_mul(step)
                .ok_or_else(|| RecdexError::internal("slice step overflow"))?
        } else {
            1
        };
        Ok(Self::reduced(first, step, len))
    }

    #[must_use]
    pub const fn iter(&self) -> SlicePositions {
        SlicePositions {
            next: self.start,
            step: self.step,
            remaining: self.len,
        }
    }
}

impl IntoIterator for SliceRange {
    type Item = u64;
    type IntoIter = SlicePositions;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Positions of a [`SliceRange`], in slice order.
#[derive(Debug, Clone)]
pub struct SlicePositions {
    next: i64,
    step: i64,
    remaining: u64,
}

impl Iterator for SlicePositions {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        let position = self.next as u64;
        self.remaining -= 1;
        if self.remaining > 0 {
            self.next += self.step;
        }
        Some(position)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SlicePositions {}

/// Map a possibly negative positional index onto `[0, count)`.
///
/// `handler` names the object being indexed in the error message.
pub fn normalize_index(index: i64, count: u64, handler: &str) -> Result<u64> {
    let resolved = if index < 0 {
        count.checked_sub(index.unsigned_abs())
    } else {
        Some(index as u64).filter(|&i| i < count)
    };
    resolved.ok_or_else(|| RecdexError::IndexOutOfBounds {
        handler: handler.to_owned(),
        index,
        count,
    })
}
