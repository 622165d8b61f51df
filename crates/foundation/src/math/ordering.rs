//! Total ordering for floats that end up in sort keys.

use core::cmp::Ordering;
use core::hash::{Hash, Hasher};

/// Folds `-0.0` into `0.0` and every NaN payload into one NaN, so equal
/// priorities compare equal however they were computed.
pub fn canonical_f64(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else if v.is_nan() {
        f64::NAN
    } else {
        v
    }
}

pub fn stable_total_cmp_f64(a: f64, b: f64) -> Ordering {
    canonical_f64(a).total_cmp(&canonical_f64(b))
}

/// An `f64` usable in ordered and hashed keys.
#[derive(Debug, Copy, Clone, Default)]
pub struct StableF64(pub f64);

impl Ord for StableF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        stable_total_cmp_f64(self.0, other.0)
    }
}

impl PartialOrd for StableF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for StableF64 {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for StableF64 {}

impl Hash for StableF64 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        canonical_f64(self.0).to_bits().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::StableF64;

    #[test]
    fn signed_zeros_share_a_key() {
        let keys: BTreeSet<StableF64> = [StableF64(-0.0), StableF64(0.0)].into_iter().collect();
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn nan_sorts_above_every_number() {
        let mut values = vec![
            StableF64(f64::NAN),
            StableF64(-3.5),
            StableF64(f64::INFINITY),
            StableF64(-0.0),
        ];
        values.sort();
        let raw: Vec<f64> = values.iter().map(|v| v.0).collect();
        assert_eq!(&raw[..3], &[-3.5, 0.0, f64::INFINITY]);
        assert!(raw[3].is_nan());
        assert_eq!(StableF64(f64::NAN), StableF64(-f64::NAN));
    }
}
