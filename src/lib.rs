//! # Flatbits
//!
//! Expand 64-bit structural masks into ascending stream offsets.
//!
//! A SIMD scanner classifies each 64-byte window of its input into a `u64`
//! mask (bit `i` set means byte `i` of the window matters). This crate turns
//! those masks into the `u32` offset array that a later parsing stage walks,
//! optimized for x86_64 (BMI1/POPCNT) with portable fallbacks.
//!
//! ## Quick Start
//!
//! ```
//! use flatbits::{flatten_windows, required_len};
//!
//! // Masks for three consecutive windows
//! let masks = [0b1u64, 0, 0b1010];
//! let mut out = vec![0u32; required_len(0, &masks)];
//! let mut cursor = 0;
//!
//! // The first window's index is one window past its start
//! flatten_windows(&mut out, &mut cursor, 64, &masks).unwrap();
//! assert_eq!(&out[..cursor as usize], &[0, 129, 131]);
//! ```
//!
//! ## Features
//!
//! Bit primitive strategies (mutually exclusive, for benchmarking):
//! - Default: Rust's `count_ones()`/`trailing_zeros()`
//! - `simd` - Use explicit BMI1/POPCNT intrinsics on x86_64 (runtime detected)
//! - `portable-bitops` - Use portable bitwise algorithms (no intrinsics)
//!
//! Other features:
//! - `std` (default) - Runtime CPU detection and `std::error::Error`
//! - `serde` - Enable serialization/deserialization support

// Use no_std unless std feature is enabled or we're in test mode
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod bitops;
mod error;
mod flatten;

#[cfg(target_arch = "x86_64")]
pub use bitops::Bmi1;
pub use bitops::{Backend, BitOps, Native, Portable};
pub use error::FlattenError;
pub use flatten::{
    active_backend, flatten_bits, flatten_bits_unchecked, flatten_bits_with, flatten_windows,
    required_len, worst_case_len, written_extent, GROUP, SLACK, UNROLLED_GROUPS, WINDOW_BITS,
};

/// Backend choice for flattening runs.
///
/// The free functions always use the build's backend ([`active_backend`]);
/// a `Config` lets callers pin one, e.g. to compare backends.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// Backend used by [`Config::flatten_windows`] (default: [`active_backend`])
    pub backend: Backend,
}

impl Config {
    /// Config pinned to `backend`.
    pub fn with_backend(backend: Backend) -> Self {
        Self { backend }
    }

    /// [`flatten_windows`] on this config's backend.
    ///
    /// An unavailable backend (e.g. [`Backend::Bmi1`] on a CPU without BMI1)
    /// falls back to [`Native`]; the output is identical either way.
    pub fn flatten_windows(
        &self,
        out: &mut [u32],
        cursor: &mut u32,
        first_idx: u32,
        masks: &[u64],
    ) -> Result<(), FlattenError> {
        flatten::flatten_windows_on(self.backend, out, cursor, first_idx, masks)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: active_backend(),
        }
    }
}
