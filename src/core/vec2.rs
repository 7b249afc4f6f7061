//! Fixed-Point 2D Vector
//!
//! Map positions carried by commands (move targets, issue-time origins).

use std::fmt;
use serde::{Serialize, Deserialize};

use super::fixed::{Fixed, FIXED_SCALE, fixed_square_wide, from_f32, to_float};

/// 2D vector with fixed-point components.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FixedVec2 {
    /// X component (Q16.16 fixed-point)
    pub x: Fixed,
    /// Y component (Q16.16 fixed-point)
    pub y: Fixed,
}

impl FixedVec2 {
    /// Zero vector
    pub const ZERO: Self = Self { x: 0, y: 0 };

    /// Create a new vector from fixed-point components.
    #[inline]
    pub const fn new(x: Fixed, y: Fixed) -> Self {
        Self { x, y }
    }

    /// Create a vector from integer components.
    #[inline]
    pub const fn from_ints(x: i32, y: i32) -> Self {
        Self {
            x: x << FIXED_SCALE,
            y: y << FIXED_SCALE,
        }
    }

    /// Create a vector from float components (input edge only).
    #[inline]
    pub fn from_floats(x: f32, y: f32) -> Self {
        Self {
            x: from_f32(x),
            y: from_f32(y),
        }
    }

    /// Squared distance to another point in Q32.32.
    ///
    /// Computed in i64 so points at opposite ends of the map do not overflow.
    #[inline]
    pub fn distance_squared_wide(self, other: Self) -> i64 {
        let dx = (other.x as i64 - self.x as i64).clamp(i32::MIN as i64, i32::MAX as i64) as Fixed;
        let dy = (other.y as i64 - self.y as i64).clamp(i32::MIN as i64, i32::MAX as i64) as Fixed;
        fixed_square_wide(dx) + fixed_square_wide(dy)
    }

    /// Whether `other` lies further than `distance` from this point.
    #[inline]
    pub fn exceeds_distance(self, other: Self, distance: Fixed) -> bool {
        self.distance_squared_wide(other) > fixed_square_wide(distance)
    }
}

impl fmt::Debug for FixedVec2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", to_float(self.x), to_float(self.y))
    }
}

impl fmt::Display for FixedVec2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2})", to_float(self.x), to_float(self.y))
    }
}
