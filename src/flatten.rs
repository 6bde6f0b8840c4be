//! Bitmask flattening: expand a 64-bit window mask into absolute offsets.
//!
//! A scanner classifies each 64-byte window of its input into a mask where
//! bit `i` marks byte `i` of the window. [`flatten_bits_unchecked`] appends
//! the absolute offset of every set bit, lowest bit first, to a caller-owned
//! `u32` buffer and advances the caller's cursor by the number of set bits.
//!
//! ## Index convention
//!
//! `idx` is the offset *one window past* the window being flattened: the
//! scanner advances its index by 64 before calling, so each offset is
//! `idx - 64 + bit_position`.
//!
//! ## Overflow writes
//!
//! The kernel writes in unconditional groups of [`GROUP`] slots so the common
//! case (at most [`GROUP`] bits per window) runs without data-dependent
//! branches. Up to [`SLACK`] slots past the last valid offset are overwritten
//! with filler (`tzcnt(0) == 64`, so the filler value is `idx`). Only the
//! first `popcount(mask)` slots are output; the rest is scratch that the next
//! call overwrites. Buffers must be sized with that slack, see
//! [`written_extent`] and [`required_len`].
//!
//! ## Backend selection
//!
//! Priority: `portable-bitops` > `simd` > default.
//!
//! - `portable-bitops`: [`Portable`]
//! - `simd` (x86_64): [`Bmi1`] when detected, else [`Native`]
//! - default: [`Native`]

use crate::bitops::{Backend, BitOps, Native, Portable};
use crate::error::FlattenError;

#[cfg(target_arch = "x86_64")]
use crate::bitops::Bmi1;

/// Bytes (and mask bits) per window.
pub const WINDOW_BITS: u32 = 64;

/// Slots written per unrolled group.
///
/// Tuning constant: changing it changes how many filler slots are written,
/// never the valid output.
pub const GROUP: usize = 8;

/// Number of unrolled groups before the one-bit-at-a-time tail loop.
pub const UNROLLED_GROUPS: usize = 2;

/// Maximum number of filler slots written past the last valid offset.
pub const SLACK: usize = GROUP - 1;

/// Number of slots a single call writes for a mask with `count` set bits.
///
/// Counts up to `GROUP * UNROLLED_GROUPS` are rounded up to a whole group;
/// larger counts are written exactly by the tail loop. The result never
/// exceeds `count + SLACK` or `WINDOW_BITS`.
#[inline]
pub const fn written_extent(count: usize) -> usize {
    if count == 0 {
        0
    } else if count <= GROUP * UNROLLED_GROUPS {
        count.div_ceil(GROUP) * GROUP
    } else {
        count
    }
}

/// Exact buffer length a [`flatten_windows`] run starting at `cursor` needs.
///
/// This is the furthest slot any window writes, filler included.
pub fn required_len(cursor: u32, masks: &[u64]) -> usize {
    scan_run(cursor, masks).1
}

/// Buffer length that is always enough for `windows` windows starting at `cursor`.
///
/// No slack is needed on top: a window never writes more than 64 slots, and
/// each earlier window advances the cursor by at most 64.
pub const fn worst_case_len(cursor: u32, windows: usize) -> usize {
    (cursor as usize).saturating_add(windows.saturating_mul(WINDOW_BITS as usize))
}

/// Returns `(end_cursor, reach)` for a run, in `u64`/`usize` to avoid overflow.
fn scan_run(cursor: u32, masks: &[u64]) -> (u64, usize) {
    let mut end = cursor as u64;
    let mut reach = cursor as usize;
    for &mask in masks {
        let count = mask.count_ones();
        reach = reach.max((end as usize).saturating_add(written_extent(count as usize)));
        end += count as u64;
    }
    (end, reach)
}

/// Appends the absolute offsets of `mask`'s set bits to `out[*cursor..]`.
///
/// Uses the backend chosen for this build (see [`active_backend`]). A zero
/// mask returns immediately without touching `out` or `cursor`.
///
/// # Safety
/// - `idx >= 64`
/// - `out.len() >= *cursor as usize + written_extent(mask.count_ones() as usize)`
/// - `*cursor + mask.count_ones()` fits in `u32`
#[inline]
pub unsafe fn flatten_bits_unchecked(out: &mut [u32], cursor: &mut u32, idx: u32, mask: u64) {
    if mask == 0 {
        return;
    }
    unsafe { flatten_run_unchecked(out, cursor, idx, core::slice::from_ref(&mask)) }
}

/// Flattens one window with an explicit backend.
///
/// Writes `ops.popcount(mask)` offsets plus up to [`SLACK`] filler slots,
/// then advances `cursor`.
///
/// # Safety
/// Same contract as [`flatten_bits_unchecked`].
#[inline(always)]
pub unsafe fn flatten_bits_with<B: BitOps>(
    ops: B,
    out: &mut [u32],
    cursor: &mut u32,
    idx: u32,
    mut mask: u64,
) {
    if mask == 0 {
        return;
    }

    let cnt = ops.popcount(mask);
    debug_assert!(idx >= WINDOW_BITS, "idx {} below window width", idx);
    debug_assert!(
        out.len() >= *cursor as usize + written_extent(cnt as usize),
        "output buffer too small"
    );

    let next_cursor = *cursor + cnt;
    let base = idx.wrapping_sub(WINDOW_BITS);
    let cnt = cnt as usize;

    unsafe {
        let mut ptr = out.as_mut_ptr().add(*cursor as usize);

        write_group(ops, ptr, base, &mut mask);
        ptr = ptr.add(GROUP);
        let mut written = GROUP;

        // Predictable: most windows stop after the first group.
        for _ in 1..UNROLLED_GROUPS {
            if cnt <= written {
                break;
            }
            write_group(ops, ptr, base, &mut mask);
            ptr = ptr.add(GROUP);
            written += GROUP;
        }

        // Rare: more than one marker every four bytes, e.g. `"","","",...`
        if cnt > written {
            loop {
                ptr.write(base.wrapping_add(ops.tzcnt(mask)));
                mask = ops.blsr(mask);
                ptr = ptr.add(1);
                if mask == 0 {
                    break;
                }
            }
        }
    }

    *cursor = next_cursor;
}

/// Writes exactly `GROUP` slots, consuming up to `GROUP` bits of `mask`.
#[inline(always)]
unsafe fn write_group<B: BitOps>(ops: B, ptr: *mut u32, base: u32, mask: &mut u64) {
    // Constant trip count, fully unrolled by LLVM.
    for i in 0..GROUP {
        unsafe { ptr.add(i).write(base.wrapping_add(ops.tzcnt(*mask))) };
        *mask = ops.blsr(*mask);
    }
}

#[inline(always)]
unsafe fn run_with<B: BitOps>(
    ops: B,
    out: &mut [u32],
    cursor: &mut u32,
    first_idx: u32,
    masks: &[u64],
) {
    let mut idx = first_idx;
    for &mask in masks {
        unsafe { flatten_bits_with(ops, out, cursor, idx, mask) };
        idx = idx.wrapping_add(WINDOW_BITS);
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "bmi1,popcnt")]
unsafe fn run_bmi1(ops: Bmi1, out: &mut [u32], cursor: &mut u32, first_idx: u32, masks: &[u64]) {
    unsafe { run_with(ops, out, cursor, first_idx, masks) }
}

/// Runs consecutive windows on the build's backend, dispatching once.
#[inline]
unsafe fn flatten_run_unchecked(out: &mut [u32], cursor: &mut u32, first_idx: u32, masks: &[u64]) {
    #[cfg(feature = "portable-bitops")]
    {
        unsafe { run_with(Portable, out, cursor, first_idx, masks) }
    }

    #[cfg(all(
        feature = "simd",
        target_arch = "x86_64",
        not(feature = "portable-bitops")
    ))]
    {
        match Bmi1::detect() {
            // SAFETY: the token proves BMI1 and POPCNT are available
            Some(bmi1) => unsafe { run_bmi1(bmi1, out, cursor, first_idx, masks) },
            None => unsafe { run_with(Native, out, cursor, first_idx, masks) },
        }
    }

    #[cfg(not(any(
        feature = "portable-bitops",
        all(feature = "simd", target_arch = "x86_64")
    )))]
    {
        unsafe { run_with(Native, out, cursor, first_idx, masks) }
    }
}

/// Runs consecutive windows on an explicitly named backend.
///
/// Falls back to [`Native`] when `backend` is unavailable on this CPU.
unsafe fn flatten_run_on(
    backend: Backend,
    out: &mut [u32],
    cursor: &mut u32,
    first_idx: u32,
    masks: &[u64],
) {
    match backend {
        Backend::Portable => unsafe { run_with(Portable, out, cursor, first_idx, masks) },
        #[cfg(target_arch = "x86_64")]
        Backend::Bmi1 => match Bmi1::detect() {
            Some(bmi1) => unsafe { run_bmi1(bmi1, out, cursor, first_idx, masks) },
            None => unsafe { run_with(Native, out, cursor, first_idx, masks) },
        },
        _ => unsafe { run_with(Native, out, cursor, first_idx, masks) },
    }
}

/// The backend [`flatten_bits_unchecked`] uses on this machine.
pub fn active_backend() -> Backend {
    #[cfg(feature = "portable-bitops")]
    {
        Backend::Portable
    }

    #[cfg(all(
        feature = "simd",
        target_arch = "x86_64",
        not(feature = "portable-bitops")
    ))]
    {
        if Bmi1::detect().is_some() {
            Backend::Bmi1
        } else {
            Backend::Native
        }
    }

    #[cfg(not(any(
        feature = "portable-bitops",
        all(feature = "simd", target_arch = "x86_64")
    )))]
    {
        Backend::Native
    }
}

/// Checked version of [`flatten_bits_unchecked`].
///
/// A zero mask returns `Ok` before any validation. On error nothing is
/// written and `cursor` is unchanged.
///
/// # Example
/// ```
/// use flatbits::flatten_bits;
///
/// let mut out = [0u32; 16];
/// let mut cursor = 0;
/// flatten_bits(&mut out, &mut cursor, 128, 0b1010).unwrap();
/// assert_eq!(cursor, 2);
/// assert_eq!(&out[..2], &[65, 67]);
/// ```
pub fn flatten_bits(
    out: &mut [u32],
    cursor: &mut u32,
    idx: u32,
    mask: u64,
) -> Result<(), FlattenError> {
    if mask == 0 {
        return Ok(());
    }
    check_run(out, *cursor, idx, core::slice::from_ref(&mask))?;
    // SAFETY: check_run validated idx, cursor overflow and buffer extent
    unsafe { flatten_run_unchecked(out, cursor, idx, core::slice::from_ref(&mask)) };
    Ok(())
}

/// Flattens consecutive windows: `masks[k]` is flattened with
/// `idx = first_idx + 64 * k`.
///
/// Validation runs once for the whole run, then every window goes through
/// the unchecked kernel. The result equals calling [`flatten_bits`] for each
/// window in order. On error nothing is written and `cursor` is unchanged.
///
/// # Example
/// ```
/// use flatbits::{flatten_windows, required_len};
///
/// let masks = [0b1, 0, 1 << 63];
/// let mut out = vec![0u32; required_len(0, &masks)];
/// let mut cursor = 0;
/// flatten_windows(&mut out, &mut cursor, 64, &masks).unwrap();
/// assert_eq!(&out[..cursor as usize], &[0, 191]);
/// ```
pub fn flatten_windows(
    out: &mut [u32],
    cursor: &mut u32,
    first_idx: u32,
    masks: &[u64],
) -> Result<(), FlattenError> {
    check_run(out, *cursor, first_idx, masks)?;
    // SAFETY: check_run validated indices, cursor overflow and buffer extent
    unsafe { flatten_run_unchecked(out, cursor, first_idx, masks) };
    Ok(())
}

/// Like [`flatten_windows`], on the backend `backend` names.
pub(crate) fn flatten_windows_on(
    backend: Backend,
    out: &mut [u32],
    cursor: &mut u32,
    first_idx: u32,
    masks: &[u64],
) -> Result<(), FlattenError> {
    check_run(out, *cursor, first_idx, masks)?;
    // SAFETY: check_run validated indices, cursor overflow and buffer extent
    unsafe { flatten_run_on(backend, out, cursor, first_idx, masks) };
    Ok(())
}

/// Call-site validation of a whole run.
fn check_run(out: &[u32], cursor: u32, first_idx: u32, masks: &[u64]) -> Result<(), FlattenError> {
    if masks.is_empty() {
        return Ok(());
    }
    if first_idx < WINDOW_BITS {
        return Err(FlattenError::IndexUnderflow { idx: first_idx });
    }

    let overflow = FlattenError::OffsetOverflow {
        first_idx,
        windows: masks.len(),
    };
    let last_idx = first_idx as u64 + (masks.len() as u64 - 1) * WINDOW_BITS as u64;
    if last_idx > u32::MAX as u64 {
        return Err(overflow);
    }

    let (end, reach) = scan_run(cursor, masks);
    if end > u32::MAX as u64 {
        return Err(overflow);
    }
    if out.len() < reach {
        return Err(FlattenError::BufferTooSmall {
            required: reach,
            available: out.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference: one bit at a time, no filler writes.
    fn naive_offsets(idx: u32, mut mask: u64) -> Vec<u32> {
        let mut offsets = Vec::new();
        while mask != 0 {
            offsets.push(idx - 64 + mask.trailing_zeros());
            mask &= mask - 1;
        }
        offsets
    }

    fn flatten_one(idx: u32, mask: u64) -> (Vec<u32>, u32) {
        let mut out = vec![0u32; 64 + SLACK];
        let mut cursor = 0;
        flatten_bits(&mut out, &mut cursor, idx, mask).unwrap();
        (out, cursor)
    }

    #[test]
    fn test_zero_mask_is_noop() {
        let mut out = vec![7u32; 8];
        let mut cursor = 3;
        flatten_bits(&mut out, &mut cursor, 64, 0).unwrap();
        assert_eq!(cursor, 3);
        assert!(out.iter().all(|&v| v == 7));
    }

    #[test]
    fn test_zero_mask_skips_validation() {
        let mut out: [u32; 0] = [];
        let mut cursor = 0;
        assert_eq!(flatten_bits(&mut out, &mut cursor, 0, 0), Ok(()));
    }

    #[test]
    fn test_single_low_bit() {
        let (out, cursor) = flatten_one(64, 0b1);
        assert_eq!(cursor, 1);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_two_bits_second_window() {
        let (out, cursor) = flatten_one(128, 0b1010);
        assert_eq!(cursor, 2);
        assert_eq!(&out[..2], &[65, 67]);
    }

    #[test]
    fn test_twenty_bits_uses_tail() {
        let mut mask = 0u64;
        for bit in [0, 2, 3, 7, 11, 12, 13, 19, 22, 25, 30, 31, 36, 40, 41, 47, 50, 55, 60, 63] {
            mask |= 1 << bit;
        }
        assert_eq!(mask.count_ones(), 20);

        let (out, cursor) = flatten_one(1024, mask);
        assert_eq!(cursor, 20);
        assert_eq!(&out[..20], naive_offsets(1024, mask).as_slice());
    }

    #[test]
    fn test_all_bits_set() {
        let (out, cursor) = flatten_one(256, u64::MAX);
        assert_eq!(cursor, 64);
        let expected: Vec<u32> = (192..256).collect();
        assert_eq!(&out[..64], expected.as_slice());
    }

    #[test]
    fn test_group_boundaries() {
        for count in [1usize, 7, 8, 9, 15, 16, 17, 24, 63] {
            // `count` high bits, so the offsets sit at the end of the window
            let mask = ((1u64 << count) - 1) << (64 - count);
            let (out, cursor) = flatten_one(640, mask);
            assert_eq!(cursor as usize, count, "count={}", count);
            assert_eq!(
                &out[..count],
                naive_offsets(640, mask).as_slice(),
                "count={}",
                count
            );
        }
    }

    #[test]
    fn test_filler_slots_hold_idx() {
        let mut out = vec![0u32; 16];
        let mut cursor = 0;
        flatten_bits(&mut out, &mut cursor, 192, 0b100).unwrap();
        assert_eq!(cursor, 1);
        assert_eq!(out[0], 130);
        // tzcnt(0) == 64, so filler is base + 64 == idx
        assert!(out[1..GROUP].iter().all(|&v| v == 192));
        assert!(out[GROUP..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_appends_at_cursor() {
        let mut out = vec![u32::MAX; 32];
        let mut cursor = 5;
        flatten_bits(&mut out, &mut cursor, 64, 0b11).unwrap();
        assert_eq!(cursor, 7);
        assert!(out[..5].iter().all(|&v| v == u32::MAX));
        assert_eq!(&out[5..7], &[0, 1]);
    }

    #[test]
    fn test_written_extent() {
        assert_eq!(written_extent(0), 0);
        assert_eq!(written_extent(1), 8);
        assert_eq!(written_extent(8), 8);
        assert_eq!(written_extent(9), 16);
        assert_eq!(written_extent(16), 16);
        assert_eq!(written_extent(17), 17);
        assert_eq!(written_extent(64), 64);
        for count in 0..=64 {
            assert!(written_extent(count) <= count + SLACK);
            assert!(written_extent(count) <= WINDOW_BITS as usize);
            assert!(written_extent(count) >= count);
        }
    }

    #[test]
    fn test_buffer_too_small() {
        let mut out = vec![0u32; 7];
        let mut cursor = 0;
        let err = flatten_bits(&mut out, &mut cursor, 64, 0b1).unwrap_err();
        assert_eq!(
            err,
            FlattenError::BufferTooSmall {
                required: 8,
                available: 7
            }
        );
        assert_eq!(cursor, 0);
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_index_underflow() {
        let mut out = vec![0u32; 8];
        let mut cursor = 0;
        assert_eq!(
            flatten_bits(&mut out, &mut cursor, 63, 1),
            Err(FlattenError::IndexUnderflow { idx: 63 })
        );
    }

    #[test]
    fn test_cursor_overflow() {
        let mut out: [u32; 0] = [];
        let mut cursor = u32::MAX;
        assert_eq!(
            flatten_bits(&mut out, &mut cursor, 64, 1),
            Err(FlattenError::OffsetOverflow {
                first_idx: 64,
                windows: 1
            })
        );
        assert_eq!(cursor, u32::MAX);
    }

    #[test]
    fn test_windows_match_single_calls() {
        let masks = [0b1u64, 0, u64::MAX, 0x8000_0000_0000_0001, 0xFF00, 0];
        let mut run = vec![0u32; required_len(0, &masks)];
        let mut run_cursor = 0;
        flatten_windows(&mut run, &mut run_cursor, 64, &masks).unwrap();

        let mut single = vec![0u32; worst_case_len(0, masks.len())];
        let mut single_cursor = 0;
        for (k, &mask) in masks.iter().enumerate() {
            flatten_bits(&mut single, &mut single_cursor, 64 + 64 * k as u32, mask).unwrap();
        }

        assert_eq!(run_cursor, single_cursor);
        assert_eq!(
            &run[..run_cursor as usize],
            &single[..single_cursor as usize]
        );
    }

    #[test]
    fn test_windows_index_overflow() {
        let mut out = vec![0u32; 256];
        let mut cursor = 0;
        let err = flatten_windows(&mut out, &mut cursor, u32::MAX - 63, &[1, 1]).unwrap_err();
        assert_eq!(
            err,
            FlattenError::OffsetOverflow {
                first_idx: u32::MAX - 63,
                windows: 2
            }
        );
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_windows_last_window_at_max_index() {
        let mut out = vec![0u32; 8];
        let mut cursor = 0;
        flatten_windows(&mut out, &mut cursor, u32::MAX, &[1 << 63]).unwrap();
        assert_eq!(cursor, 1);
        assert_eq!(out[0], u32::MAX - 1);
    }

    #[test]
    fn test_windows_empty() {
        let mut out: [u32; 0] = [];
        let mut cursor = 9;
        flatten_windows(&mut out, &mut cursor, 0, &[]).unwrap();
        assert_eq!(cursor, 9);
    }

    #[test]
    fn test_required_len() {
        assert_eq!(required_len(0, &[]), 0);
        assert_eq!(required_len(4, &[0, 0]), 4);
        assert_eq!(required_len(0, &[1]), 8);
        // Second window's filler reaches further than the first's.
        assert_eq!(required_len(0, &[0xFF, 0b1]), 16);
        assert_eq!(required_len(0, &[u64::MAX, u64::MAX]), 128);
        // A later sparse window can end before an earlier window's filler.
        assert_eq!(required_len(0, &[0xFFFF, 0]), 16);
    }

    #[test]
    fn test_worst_case_len_is_enough() {
        let patterns = [0u64, 1, 0xFF, 0x1FF, 0xFFFF, 0x1_FFFF, u64::MAX];
        for &a in &patterns {
            for &b in &patterns {
                for &c in &patterns {
                    let masks = [a, b, c];
                    assert!(required_len(3, &masks) <= worst_case_len(3, masks.len()));
                }
            }
        }
    }

    #[test]
    fn test_explicit_backends_agree() {
        let masks = [0b1u64, 0xDEAD_BEEF_0000_0001, u64::MAX, 0, 0x1111_1111_1111_1111];
        let expected: Vec<u32> = masks
            .iter()
            .enumerate()
            .flat_map(|(k, &m)| naive_offsets(64 + 64 * k as u32, m))
            .collect();

        for backend in [Backend::Portable, Backend::Native, Backend::Bmi1] {
            let mut out = vec![0u32; required_len(0, &masks)];
            let mut cursor = 0;
            flatten_windows_on(backend, &mut out, &mut cursor, 64, &masks).unwrap();
            assert_eq!(&out[..cursor as usize], expected.as_slice(), "{}", backend);
        }
    }

    #[test]
    fn test_active_backend_is_available() {
        assert!(active_backend().is_available());
    }

    #[cfg(feature = "portable-bitops")]
    #[test]
    fn test_portable_feature_selects_portable() {
        assert_eq!(active_backend(), Backend::Portable);
    }
}
