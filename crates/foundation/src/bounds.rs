/// Axis-aligned boxes.
///
/// `Aabb3` is the display-space box used for frustum tests. `BoxN` is a
/// half-open box `[lower, upper)` of arbitrary rank used for voxel and model
/// space reasoning.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb3 {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Aabb3 {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Aabb3 { min, max }
    }

    pub fn center(&self) -> [f64; 3] {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }

    /// Smallest box containing all `points`. Returns `None` for an empty set.
    pub fn from_points(points: impl IntoIterator<Item = [f64; 3]>) -> Option<Self> {
        let mut it = points.into_iter();
        let first = it.next()?;
        let mut out = Aabb3::new(first, first);
        for p in it {
            for d in 0..3 {
                out.min[d] = out.min[d].min(p[d]);
                out.max[d] = out.max[d].max(p[d]);
            }
        }
        Some(out)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BoxN {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl BoxN {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Self {
        debug_assert_eq!(lower.len(), upper.len());
        Self { lower, upper }
    }

    pub fn rank(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower
            .iter()
            .zip(&self.upper)
            .any(|(lo, hi)| !(lo < hi))
    }

    pub fn intersect(&self, other: &BoxN) -> BoxN {
        let lower = self
            .lower
            .iter()
            .zip(&other.lower)
            .map(|(a, b)| a.max(*b))
            .collect();
        let upper = self
            .upper
            .iter()
            .zip(&other.upper)
            .map(|(a, b)| a.min(*b))
            .collect();
        BoxN { lower, upper }
    }

    pub fn center(&self) -> Vec<f64> {
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(lo, hi)| 0.5 * (lo + hi))
            .collect()
    }

    /// All `2^rank` corners. Dimensions with zero extent contribute a single
    /// coordinate, so degenerate boxes don't produce duplicates.
    pub fn corners(&self) -> Vec<Vec<f64>> {
        let mut out: Vec<Vec<f64>> = vec![Vec::with_capacity(self.rank())];
        for (lo, hi) in self.lower.iter().zip(&self.upper) {
            let mut next = Vec::with_capacity(out.len() * 2);
            for prefix in &out {
                let mut a = prefix.clone();
                a.push(*lo);
                next.push(a);
                if hi != lo {
                    let mut b = prefix.clone();
                    b.push(*hi);
                    next.push(b);
                }
            }
            out = next;
        }
        out
    }

    /// Smallest box containing all `points`, each of which must have rank `rank`.
    pub fn from_points<'a>(
        rank: usize,
        points: impl IntoIterator<Item = &'a [f64]>,
    ) -> Option<Self> {
        let mut lower = vec![f64::INFINITY; rank];
        let mut upper = vec![f64::NEG_INFINITY; rank];
        let mut any = false;
        for p in points {
            any = true;
            for d in 0..rank {
                lower[d] = lower[d].min(p[d]);
                upper[d] = upper[d].max(p[d]);
            }
        }
        any.then_some(BoxN { lower, upper })
    }
}

#[cfg(test)]
mod tests {
    use super::{Aabb3, BoxN};

    #[test]
    fn intersect_and_empty() {
        let a = BoxN::new(vec![0.0, 0.0], vec![4.0, 4.0]);
        let b = BoxN::new(vec![2.0, -1.0], vec![6.0, 3.0]);
        let c = a.intersect(&b);
        assert_eq!(c, BoxN::new(vec![2.0, 0.0], vec![4.0, 3.0]));
        assert!(!c.is_empty());

        let d = BoxN::new(vec![5.0, 0.0], vec![6.0, 1.0]);
        assert!(a.intersect(&d).is_empty());
    }

    #[test]
    fn corners_skip_degenerate_dims() {
        let b = BoxN::new(vec![0.0, 1.0, 2.0], vec![1.0, 1.0, 3.0]);
        let corners = b.corners();
        assert_eq!(corners.len(), 4);
        assert!(corners.iter().all(|c| c[1] == 1.0));
    }

    #[test]
    fn aabb_from_points() {
        let b = Aabb3::from_points([[1.0, 2.0, 3.0], [-1.0, 5.0, 0.0]]).unwrap();
        assert_eq!(b.min, [-1.0, 2.0, 0.0]);
        assert_eq!(b.max, [1.0, 5.0, 3.0]);
        assert_eq!(b.center(), [0.0, 3.5, 1.5]);
        assert!(Aabb3::from_points(std::iter::empty()).is_none());
    }
}
