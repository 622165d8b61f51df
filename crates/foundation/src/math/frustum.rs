use crate::bounds::Aabb3;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Plane {
    pub n: [f64; 3],
    pub d: f64,
}

impl Plane {
    pub fn new(n: [f64; 3], d: f64) -> Self {
        Self { n, d }
    }

    pub fn normalize(self) -> Self {
        let l2 = self.n[0] * self.n[0] + self.n[1] * self.n[1] + self.n[2] * self.n[2];
        if l2 <= 0.0 {
            return self;
        }
        let inv = 1.0 / l2.sqrt();
        Self {
            n: [self.n[0] * inv, self.n[1] * inv, self.n[2] * inv],
            d: self.d * inv,
        }
    }

    pub fn distance(&self, p: [f64; 3]) -> f64 {
        self.n[0] * p[0] + self.n[1] * p[1] + self.n[2] * p[2] + self.d
    }
}

/// View frustum as 6 planes in display space.
///
/// A point `p` is inside iff `plane.distance(p) >= 0` for all planes.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    pub fn new(
        left: Plane,
        right: Plane,
        bottom: Plane,
        top: Plane,
        near: Plane,
        far: Plane,
    ) -> Self {
        Self {
            planes: [left, right, bottom, top, near, far],
        }
    }

    /// Orthographic frustum equal to `bounds`, which is what a slice view
    /// sees: the viewport rectangle extruded by the slab thickness.
    pub fn orthographic(bounds: &Aabb3) -> Self {
        let [x0, y0, z0] = bounds.min;
        let [x1, y1, z1] = bounds.max;
        Self::new(
            Plane::new([1.0, 0.0, 0.0], -x0),
            Plane::new([-1.0, 0.0, 0.0], x1),
            Plane::new([0.0, 1.0, 0.0], -y0),
            Plane::new([0.0, -1.0, 0.0], y1),
            Plane::new([0.0, 0.0, 1.0], -z0),
            Plane::new([0.0, 0.0, -1.0], z1),
        )
    }

    /// Build a frustum from a row-major view-projection matrix; visible clip
    /// coordinates satisfy `-w <= x, y, z <= w`.
    pub fn from_view_proj_row_major(m: [[f64; 4]; 4]) -> Self {
        let [r0, r1, r2, r3] = m;
        let plane = |a: [f64; 4], sign: f64| {
            Plane::new(
                [r3[0] + sign * a[0], r3[1] + sign * a[1], r3[2] + sign * a[2]],
                r3[3] + sign * a[3],
            )
            .normalize()
        };
        Self::new(
            plane(r0, 1.0),
            plane(r0, -1.0),
            plane(r1, 1.0),
            plane(r1, -1.0),
            plane(r2, 1.0),
            plane(r2, -1.0),
        )
    }

    /// p-vertex test: the box is outside iff its vertex furthest along some
    /// plane normal is behind that plane.
    pub fn intersects_aabb(&self, aabb: &Aabb3) -> bool {
        self.planes.iter().all(|plane| {
            let p = [0, 1, 2].map(|d| {
                if plane.n[d] >= 0.0 {
                    aabb.max[d]
                } else {
                    aabb.min[d]
                }
            });
            plane.distance(p) >= 0.0
        })
    }
}
