// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::num::NonZero;

use crate::{Error, Result};

/// The largest capacity a [`ByteBuffer`][1] may have.
///
/// Allocations are limited to `isize::MAX` bytes, rounded down to the storage word size.
///
/// [1]: crate::ByteBuffer
pub const MAX_CAPACITY: usize = (isize::MAX as usize) & !(WORD_SIZE - 1);

/// Owned storage is allocated in units of this many bytes, which keeps it pointer-aligned.
pub(crate) const WORD_SIZE: usize = size_of::<usize>();

/// Capacities below this threshold double under [`GrowthStrategy::Optimal`].
pub const OPTIMAL_DOUBLING_LIMIT: usize = 64 * 1024;

/// Determines how an owned [`ByteBuffer`][1] grows when a write does not fit.
///
/// [1]: crate::ByteBuffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum GrowthStrategy {
    /// The capacity never changes. Writes that do not fit fail with
    /// [`Error::CapacityExceeded`].
    Fixed,

    /// The capacity doubles until the write fits.
    Double,

    /// The capacity grows by the given number of bytes until the write fits.
    Linear(NonZero<usize>),

    /// The capacity doubles while below 64 KiB and grows by half of itself above that.
    #[default]
    Optimal,
}

impl GrowthStrategy {
    /// Computes the capacity a buffer with `current` capacity must grow to in order to hold
    /// `required` bytes.
    ///
    /// Returns `current` unchanged if it already suffices. The result is never below
    /// `required`, never above [`MAX_CAPACITY`] and is always a multiple of the pointer size.
    /// Arithmetic saturates instead of wrapping; if the strategy would overshoot the maximum,
    /// the result is clamped to [`MAX_CAPACITY`].
    ///
    /// # Errors
    ///
    /// [`Error::CapacityOverflow`] if `required` exceeds [`MAX_CAPACITY`], and
    /// [`Error::CapacityExceeded`] for the fixed strategy when `required > current`.
    pub fn next_capacity(self, current: usize, required: usize) -> Result<usize> {
        if required <= current {
            return Ok(current);
        }

        if required > MAX_CAPACITY {
            return Err(Error::CapacityOverflow);
        }

        let candidate = match self {
            Self::Fixed => return Err(Error::CapacityExceeded { capacity: current, required }),
            Self::Double => grow_until(current, required, |c| c.saturating_mul(2)),
            Self::Linear(step) => grow_linear(current, required, step.get()),
            Self::Optimal => grow_until(current, required, |c| {
                if c < OPTIMAL_DOUBLING_LIMIT {
                    c.saturating_mul(2)
                } else {
                    c.saturating_add(c / 2)
                }
            }),
        };

        Ok(align_up(candidate.min(MAX_CAPACITY)).unwrap_or(MAX_CAPACITY).max(required))
    }
}

fn grow_until(current: usize, required: usize, step: impl Fn(usize) -> usize) -> usize {
    // A zero-capacity buffer has nothing to double, so it starts from one word.
    let mut capacity = current.max(WORD_SIZE);

    while capacity < required {
        let next = step(capacity);
        if next >= MAX_CAPACITY {
            return MAX_CAPACITY;
        }
        capacity = next;
    }

    capacity
}

fn grow_linear(current: usize, required: usize, step: usize) -> usize {
    let missing = required - current;
    let steps = missing.div_ceil(step);

    steps.checked_mul(step).and_then(|growth| current.checked_add(growth)).unwrap_or(MAX_CAPACITY)
}

/// Rounds `value` up to a multiple of the pointer size, or `None` on overflow.
pub(crate) const fn align_up(value: usize) -> Option<usize> {
    match value.checked_add(WORD_SIZE - 1) {
        Some(padded) => Some(padded & !(WORD_SIZE - 1)),
        None => None,
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sufficient_capacity_is_unchanged() {
        for strategy in [GrowthStrategy::Fixed, GrowthStrategy::Double, GrowthStrategy::Optimal] {
            assert_eq!(strategy.next_capacity(64, 10).unwrap(), 64);
            assert_eq!(strategy.next_capacity(64, 64).unwrap(), 64);
        }
    }

    #[test]
    fn fixed_refuses_growth() {
        let error = GrowthStrategy::Fixed.next_capacity(16, 17).unwrap_err();

        assert!(matches!(error, Error::CapacityExceeded { capacity: 16, required: 17 }));
    }

    #[test]
    fn double_doubles_until_fit() {
        assert_eq!(GrowthStrategy::Double.next_capacity(16, 17).unwrap(), 32);
        assert_eq!(GrowthStrategy::Double.next_capacity(16, 100).unwrap(), 128);
        assert_eq!(GrowthStrategy::Double.next_capacity(0, 3).unwrap(), WORD_SIZE);
    }

    #[test]
    fn linear_adds_steps() {
        let strategy = GrowthStrategy::Linear(NonZero::new(100).unwrap());

        // 16 + 100 = 116, aligned up to the word size.
        assert_eq!(strategy.next_capacity(16, 17).unwrap(), align_up(116).unwrap());
        assert_eq!(strategy.next_capacity(16, 300).unwrap(), align_up(316).unwrap());
    }

    #[test]
    fn optimal_switches_to_half_growth() {
        assert_eq!(GrowthStrategy::Optimal.next_capacity(1024, 1025).unwrap(), 2048);
        assert_eq!(
            GrowthStrategy::Optimal.next_capacity(OPTIMAL_DOUBLING_LIMIT, OPTIMAL_DOUBLING_LIMIT + 1).unwrap(),
            OPTIMAL_DOUBLING_LIMIT + OPTIMAL_DOUBLING_LIMIT / 2
        );
    }

    #[test]
    fn huge_requests_clamp_instead_of_wrapping() {
        let near_max = MAX_CAPACITY - 1024;

        assert_eq!(GrowthStrategy::Double.next_capacity(near_max, near_max + 1).unwrap(), MAX_CAPACITY);
        assert_eq!(GrowthStrategy::Optimal.next_capacity(near_max, MAX_CAPACITY).unwrap(), MAX_CAPACITY);

        let linear = GrowthStrategy::Linear(NonZero::new(usize::MAX).unwrap());
        assert_eq!(linear.next_capacity(8, 9).unwrap(), MAX_CAPACITY);
    }

    #[test]
    fn beyond_max_is_an_error() {
        let error = GrowthStrategy::Double.next_capacity(16, MAX_CAPACITY + 1).unwrap_err();

        assert!(matches!(error, Error::CapacityOverflow));
    }

    #[test]
    fn align_up_rounds_to_word() {
        assert_eq!(align_up(0), Some(0));
        assert_eq!(align_up(1), Some(WORD_SIZE));
        assert_eq!(align_up(WORD_SIZE), Some(WORD_SIZE));
        assert_eq!(align_up(usize::MAX), None);
    }
}
