//! BMI1/POPCNT backend for x86_64.
//!
//! ## Availability
//! - Intel: Haswell (2013+)
//! - AMD: Piledriver (2012+)
//!
//! `TZCNT` is defined for a zero input (returns the operand width, 64), unlike
//! `BSF`, which is what lets the flattener write past the last set bit
//! without a branch.

use core::arch::x86_64::{_blsr_u64, _popcnt64, _tzcnt_u64};

use super::BitOps;

/// Token for the explicit `POPCNT`/`TZCNT`/`BLSR` instructions.
///
/// A value can only be obtained through [`Bmi1::detect`] or
/// [`Bmi1::new_unchecked`], so holding one means the instructions exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bmi1 {
    _private: (),
}

impl Bmi1 {
    /// Returns a token if the CPU supports BMI1 and POPCNT.
    ///
    /// When both features are enabled at compile time this is free. Otherwise
    /// it needs the `std` feature for runtime detection; the result is cached.
    /// Without `std` and without the compile-time features it returns `None`.
    #[inline]
    pub fn detect() -> Option<Self> {
        if has_bmi1_popcnt() {
            Some(Bmi1 { _private: () })
        } else {
            None
        }
    }

    /// Creates a token without checking the CPU.
    ///
    /// # Safety
    /// The CPU must support both BMI1 and POPCNT.
    #[inline]
    pub const unsafe fn new_unchecked() -> Self {
        Bmi1 { _private: () }
    }
}

#[cfg(all(target_feature = "bmi1", target_feature = "popcnt"))]
#[inline(always)]
fn has_bmi1_popcnt() -> bool {
    true
}

#[cfg(all(
    feature = "std",
    not(all(target_feature = "bmi1", target_feature = "popcnt"))
))]
#[inline]
fn has_bmi1_popcnt() -> bool {
    use core::sync::atomic::{AtomicU8, Ordering};

    // 0 = unknown, 1 = available, 2 = not available
    static HAS_BMI1: AtomicU8 = AtomicU8::new(0);

    match HAS_BMI1.load(Ordering::Relaxed) {
        1 => true,
        2 => false,
        _ => {
            let detected = std::arch::is_x86_feature_detected!("bmi1")
                && std::arch::is_x86_feature_detected!("popcnt");
            HAS_BMI1.store(if detected { 1 } else { 2 }, Ordering::Relaxed);
            detected
        }
    }
}

#[cfg(not(any(
    feature = "std",
    all(target_feature = "bmi1", target_feature = "popcnt")
)))]
#[inline(always)]
fn has_bmi1_popcnt() -> bool {
    false
}

impl BitOps for Bmi1 {
    #[inline(always)]
    fn popcount(self, x: u64) -> u32 {
        // SAFETY: the token proves POPCNT is available
        unsafe { _popcnt64(x as i64) as u32 }
    }

    #[inline(always)]
    fn tzcnt(self, x: u64) -> u32 {
        // SAFETY: the token proves BMI1 is available
        unsafe { _tzcnt_u64(x) as u32 }
    }

    #[inline(always)]
    fn blsr(self, x: u64) -> u64 {
        // SAFETY: the token proves BMI1 is available
        unsafe { _blsr_u64(x) }
    }
}
