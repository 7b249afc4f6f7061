//! Q16.16 Fixed-Point Values
//!
//! Command parameters (positions, stopping distances, health deltas) travel
//! between peers as Q16.16 integers so every peer decodes exactly the same
//! bits. Floats are only accepted at the input edge, where the local player
//! issues a command, and are converted once.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Bit Layout: Q16.16 (32-bit signed integer)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  [S][IIIIIIIIIIIIIIII][FFFFFFFFFFFFFFFF]                    │
//! │  Range: -32768.0 to +32767.99998 (approx)                   │
//! │  Precision: 1/65536                                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

/// Q16.16 fixed-point number stored as i32.
pub type Fixed = i32;

/// Number of fractional bits (16)
pub const FIXED_SCALE: i32 = 16;

/// 1.0 in fixed-point (65536)
pub const FIXED_ONE: Fixed = 1 << FIXED_SCALE;

/// 0.5 in fixed-point (32768)
pub const FIXED_HALF: Fixed = FIXED_ONE >> 1;

/// Largest representable value
pub const FIXED_MAX: Fixed = i32::MAX;

/// Smallest representable value
pub const FIXED_MIN: Fixed = i32::MIN;

// =============================================================================
// CONVERSIONS
// =============================================================================

/// Convert a compile-time float to fixed-point.
///
/// # Example
/// ```
/// use rts_lockstep::core::fixed::{to_fixed, FIXED_ONE};
/// const STOP: i32 = to_fixed(2.5);
/// assert_eq!(STOP, FIXED_ONE * 2 + FIXED_ONE / 2);
/// ```
#[inline]
pub const fn to_fixed(f: f64) -> Fixed {
    (f * (FIXED_ONE as f64)) as Fixed
}

/// Convert a runtime float (pointer position, UI slider) into fixed-point.
///
/// Saturates at the representable range and maps NaN to zero. Only call this
/// where a command is first created; never while applying a batch.
#[inline]
pub fn from_f32(f: f32) -> Fixed {
    if f.is_nan() {
        return 0;
    }
    let scaled = (f as f64) * (FIXED_ONE as f64);
    if scaled >= FIXED_MAX as f64 {
        FIXED_MAX
    } else if scaled <= FIXED_MIN as f64 {
        FIXED_MIN
    } else {
        scaled as Fixed
    }
}

/// Convert fixed-point to float for display.
#[inline]
pub fn to_float(f: Fixed) -> f32 {
    f as f32 / FIXED_ONE as f32
}

/// Create a fixed-point value from an integer.
#[inline]
pub const fn from_int(i: i32) -> Fixed {
    i << FIXED_SCALE
}

// =============================================================================
// ARITHMETIC
// =============================================================================

/// Square a fixed-point value without truncating to Q16.16.
///
/// The result is in Q32.32 and is used for distance comparisons, where
/// squaring a large coordinate would otherwise overflow.
#[inline]
pub fn fixed_square_wide(a: Fixed) -> i64 {
    (a as i64) * (a as i64)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(FIXED_ONE, 65536);
        assert_eq!(FIXED_HALF, 32768);
        assert_eq!(from_int(5), 5 * FIXED_ONE);
    }

    #[test]
    fn test_from_f32_matches_to_fixed() {
        assert_eq!(from_f32(5.0), to_fixed(5.0));
        assert_eq!(from_f32(-2.5), to_fixed(-2.5));
        assert_eq!(from_f32(0.0), 0);
    }

    #[test]
    fn test_from_f32_saturates() {
        assert_eq!(from_f32(1.0e9), FIXED_MAX);
        assert_eq!(from_f32(-1.0e9), FIXED_MIN);
        assert_eq!(from_f32(f32::NAN), 0);
    }

    #[test]
    fn test_square_wide_does_not_overflow() {
        let big = from_int(30000);
        assert_eq!(fixed_square_wide(big), (big as i64) * (big as i64));
    }

    #[test]
    fn test_to_float() {
        assert!((to_float(to_fixed(1.25)) - 1.25).abs() < 0.0001);
    }
}
