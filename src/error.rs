//! Errors reported by the checked flatten entry points.

use core::fmt;

/// Precondition failures detected by [`flatten_bits`](crate::flatten_bits)
/// and [`flatten_windows`](crate::flatten_windows).
///
/// The unchecked kernel never reports errors; these are only produced by the
/// call-site validation done before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenError {
    /// The output buffer cannot hold the offsets plus the overflow slack.
    BufferTooSmall {
        /// Minimum `out.len()` needed
        required: usize,
        /// Actual `out.len()`
        available: usize,
    },

    /// `idx` is below one window width, so the window base would be negative.
    IndexUnderflow {
        /// The rejected index
        idx: u32,
    },

    /// A window index or the output cursor would not fit in `u32`.
    OffsetOverflow {
        /// Index of the first window in the run
        first_idx: u32,
        /// Number of windows in the run
        windows: usize,
    },
}

impl fmt::Display for FlattenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlattenError::BufferTooSmall {
                required,
                available,
            } => {
                write!(
                    f,
                    "output buffer too small: need {} slots, have {}",
                    required, available
                )
            }
            FlattenError::IndexUnderflow { idx } => {
                write!(f, "window index {} is below the window width of 64", idx)
            }
            FlattenError::OffsetOverflow { first_idx, windows } => {
                write!(
                    f,
                    "{} windows starting at index {} overflow 32-bit offsets",
                    windows, first_idx
                )
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FlattenError {}
