//! Transparent float wrapper providing total order for floats.
//!
//! Index keys and dedup sets need `Eq + Ord + Hash` over every scalar,
//! including floats. `total_cmp` gives us a stable total order; `-0.0` is
//! normalized to `0.0` at construction so total-order equality matches SQL
//! float equality, and hashing goes through the bit pattern.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Deref, DerefMut, Div, Mul, Sub};

use serde::{Deserialize, Serialize};

/// A totally ordered float64.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
#[repr(transparent)]
pub struct OrdF64(pub f64);

impl OrdF64 {
    pub fn new(v: f64) -> Self {
        // Collapse -0.0 so total_cmp equality agrees with float equality.
        Self(if v == 0.0 { 0.0 } else { v })
    }
}

impl From<f64> for OrdF64 {
    fn from(v: f64) -> Self {
        Self::new(v)
    }
}

impl From<OrdF64> for f64 {
    fn from(v: OrdF64) -> Self {
        v.0
    }
}

impl Deref for OrdF64 {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for OrdF64 {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl PartialEq for OrdF64 {
    fn eq(&self, other: &Self) -> bool {
        f64::total_cmp(self, other).is_eq()
    }
}

impl Eq for OrdF64 {}

impl PartialOrd for OrdF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(f64::total_cmp(self, other))
    }
}

impl Ord for OrdF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        f64::total_cmp(self, other)
    }
}

impl Hash for OrdF64 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl Add for OrdF64 {
    type Output = OrdF64;
    fn add(self, other: Self) -> OrdF64 {
        (self.0 + other.0).into()
    }
}

impl Sub for OrdF64 {
    type Output = OrdF64;
    fn sub(self, other: Self) -> OrdF64 {
        (self.0 - other.0).into()
    }
}

impl Div for OrdF64 {
    type Output = OrdF64;
    fn div(self, other: Self) -> OrdF64 {
        (self.0 / other.0).into()
    }
}

impl Mul for OrdF64 {
    type Output = OrdF64;
    fn mul(self, other: Self) -> OrdF64 {
        (self.0 * other.0).into()
    }
}
