//! Word-level bit primitives behind a swappable backend.
//!
//! The flattener only needs three operations on a 64-bit mask:
//!
//! - `popcount`: number of set bits
//! - `tzcnt`: position of the lowest set bit, **64 for a zero word**
//! - `blsr`: clear the lowest set bit
//!
//! Backends:
//!
//! - [`Portable`]: pure bitwise algorithms (no intrinsics)
//! - [`Native`]: Rust's `count_ones()`/`trailing_zeros()`, LLVM picks the instruction
//! - [`Bmi1`]: explicit x86_64 `POPCNT`/`TZCNT`/`BLSR` intrinsics (x86_64 only)

#[cfg(target_arch = "x86_64")]
mod x86;

#[cfg(target_arch = "x86_64")]
pub use x86::Bmi1;

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The three primitive bit operations used by the flattener.
///
/// Implementors are small `Copy` tokens; holding one is the proof that the
/// operations are usable on the running CPU.
pub trait BitOps: Copy {
    /// Number of set bits in `x`.
    fn popcount(self, x: u64) -> u32;

    /// Number of trailing zero bits in `x`.
    ///
    /// Must return 64 when `x == 0`.
    fn tzcnt(self, x: u64) -> u32;

    /// Clear the lowest set bit of `x`. `blsr(0) == 0`.
    #[inline(always)]
    fn blsr(self, x: u64) -> u64 {
        x & x.wrapping_sub(1)
    }
}

/// Portable bitwise backend (no intrinsics).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Portable;

impl Portable {
    const M1: u64 = 0x5555_5555_5555_5555; // 01010101...
    const M2: u64 = 0x3333_3333_3333_3333; // 00110011...
    const M4: u64 = 0x0f0f_0f0f_0f0f_0f0f; // 00001111...
    const H01: u64 = 0x0101_0101_0101_0101; // sum helper
}

impl BitOps for Portable {
    /// Classic parallel bit count.
    #[inline(always)]
    fn popcount(self, mut x: u64) -> u32 {
        x = x - ((x >> 1) & Self::M1);
        x = (x & Self::M2) + ((x >> 2) & Self::M2);
        x = (x + (x >> 4)) & Self::M4;
        (x.wrapping_mul(Self::H01) >> 56) as u32
    }

    /// Counts the ones below the lowest set bit. For `x == 0` that is all 64.
    #[inline(always)]
    fn tzcnt(self, x: u64) -> u32 {
        self.popcount(!x & x.wrapping_sub(1))
    }
}

/// Backend built on the standard integer methods.
///
/// On x86_64 these lower to `POPCNT`/`TZCNT` only when the target enables
/// them; on aarch64 they lower to `CNT` and `RBIT`+`CLZ`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Native;

impl BitOps for Native {
    #[inline(always)]
    fn popcount(self, x: u64) -> u32 {
        x.count_ones()
    }

    #[inline(always)]
    fn tzcnt(self, x: u64) -> u32 {
        x.trailing_zeros()
    }
}

/// Names a [`BitOps`] backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Backend {
    /// [`Portable`]
    Portable,
    /// [`Native`]
    Native,
    /// `Bmi1` (x86_64 with BMI1 and POPCNT)
    Bmi1,
}

impl Backend {
    /// Short lowercase name, e.g. for benchmark labels.
    pub fn name(self) -> &'static str {
        match self {
            Backend::Portable => "portable",
            Backend::Native => "native",
            Backend::Bmi1 => "bmi1",
        }
    }

    /// Whether this backend can run on the current CPU.
    pub fn is_available(self) -> bool {
        match self {
            Backend::Portable | Backend::Native => true,
            #[cfg(target_arch = "x86_64")]
            Backend::Bmi1 => Bmi1::detect().is_some(),
            #[cfg(not(target_arch = "x86_64"))]
            Backend::Bmi1 => false,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
