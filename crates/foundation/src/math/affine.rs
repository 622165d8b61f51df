/// Affine transform `y = A x + t` between spaces of possibly different rank.
///
/// `linear` is row-major with `out_rank` rows and `in_rank` columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Affine {
    out_rank: usize,
    in_rank: usize,
    linear: Vec<f64>,
    translation: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixError {
    Shape {
        expected: (usize, usize),
        got: (usize, usize),
    },
    RankMismatch {
        outer_in: usize,
        inner_out: usize,
    },
    NotSquare {
        out_rank: usize,
        in_rank: usize,
    },
    Singular,
}

impl std::fmt::Display for MatrixError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatrixError::Shape { expected, got } => write!(
                f,
                "matrix shape mismatch: expected {}x{}, got {}x{}",
                expected.0, expected.1, got.0, got.1
            ),
            MatrixError::RankMismatch {
                outer_in,
                inner_out,
            } => write!(
                f,
                "rank mismatch: cannot compose transform of input rank {outer_in} with output rank {inner_out}"
            ),
            MatrixError::NotSquare { out_rank, in_rank } => {
                write!(f, "transform {out_rank}x{in_rank} is not invertible (not square)")
            }
            MatrixError::Singular => write!(f, "transform is singular"),
        }
    }
}

impl std::error::Error for MatrixError {}

const SINGULAR_EPS: f64 = 1e-12;

impl Affine {
    pub fn new(
        out_rank: usize,
        in_rank: usize,
        linear: Vec<f64>,
        translation: Vec<f64>,
    ) -> Result<Self, MatrixError> {
        if linear.len() != out_rank * in_rank || translation.len() != out_rank {
            return Err(MatrixError::Shape {
                expected: (out_rank, in_rank),
                got: (translation.len(), linear.len() / out_rank.max(1)),
            });
        }
        Ok(Self {
            out_rank,
            in_rank,
            linear,
            translation,
        })
    }

    pub fn identity(rank: usize) -> Self {
        let mut linear = vec![0.0; rank * rank];
        for i in 0..rank {
            linear[i * rank + i] = 1.0;
        }
        Self {
            out_rank: rank,
            in_rank: rank,
            linear,
            translation: vec![0.0; rank],
        }
    }

    /// Diagonal scale followed by a translation.
    pub fn scale_translate(scale: &[f64], translation: &[f64]) -> Self {
        let rank = scale.len();
        let mut linear = vec![0.0; rank * rank];
        for (i, s) in scale.iter().enumerate() {
            linear[i * rank + i] = *s;
        }
        let mut t = translation.to_vec();
        t.resize(rank, 0.0);
        Self {
            out_rank: rank,
            in_rank: rank,
            linear,
            translation: t,
        }
    }

    pub fn out_rank(&self) -> usize {
        self.out_rank
    }

    pub fn in_rank(&self) -> usize {
        self.in_rank
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.linear[row * self.in_rank + col]
    }

    /// Row-major linear part.
    pub fn linear(&self) -> &[f64] {
        &self.linear
    }

    pub fn translation(&self) -> &[f64] {
        &self.translation
    }

    pub fn apply_point(&self, x: &[f64]) -> Vec<f64> {
        let mut y = self.translation.clone();
        for (r, yr) in y.iter_mut().enumerate() {
            let row = &self.linear[r * self.in_rank..(r + 1) * self.in_rank];
            *yr += row.iter().zip(x).map(|(a, b)| a * b).sum::<f64>();
        }
        y
    }

    pub fn apply_vector(&self, v: &[f64]) -> Vec<f64> {
        (0..self.out_rank)
            .map(|r| {
                let row = &self.linear[r * self.in_rank..(r + 1) * self.in_rank];
                row.iter().zip(v).map(|(a, b)| a * b).sum()
            })
            .collect()
    }

    /// `self ∘ inner`: applies `inner` first.
    pub fn compose(&self, inner: &Affine) -> Result<Affine, MatrixError> {
        if self.in_rank != inner.out_rank {
            return Err(MatrixError::RankMismatch {
                outer_in: self.in_rank,
                inner_out: inner.out_rank,
            });
        }
        let (m, k, n) = (self.out_rank, self.in_rank, inner.in_rank);
        let mut linear = vec![0.0; m * n];
        for r in 0..m {
            for c in 0..n {
                linear[r * n + c] = (0..k).map(|i| self.get(r, i) * inner.get(i, c)).sum();
            }
        }
        let mut translation = self.apply_vector(&inner.translation);
        for (t, s) in translation.iter_mut().zip(&self.translation) {
            *t += s;
        }
        Ok(Affine {
            out_rank: m,
            in_rank: n,
            linear,
            translation,
        })
    }

    /// Gauss-Jordan inverse with partial pivoting.
    pub fn inverse(&self) -> Result<Affine, MatrixError> {
        if self.out_rank != self.in_rank {
            return Err(MatrixError::NotSquare {
                out_rank: self.out_rank,
                in_rank: self.in_rank,
            });
        }
        let n = self.in_rank;
        let mut a = self.linear.clone();
        let mut inv = Affine::identity(n).linear;

        for col in 0..n {
            let pivot = (col..n)
                .max_by(|&i, &j| a[i * n + col].abs().total_cmp(&a[j * n + col].abs()))
                .ok_or(MatrixError::Singular)?;
            if a[pivot * n + col].abs() < SINGULAR_EPS {
                return Err(MatrixError::Singular);
            }
            if pivot != col {
                for c in 0..n {
                    a.swap(pivot * n + c, col * n + c);
                    inv.swap(pivot * n + c, col * n + c);
                }
            }
            let p = a[col * n + col];
            for c in 0..n {
                a[col * n + c] /= p;
                inv[col * n + c] /= p;
            }
            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = a[r * n + col];
                if factor == 0.0 {
                    continue;
                }
                for c in 0..n {
                    a[r * n + c] -= factor * a[col * n + c];
                    inv[r * n + c] -= factor * inv[col * n + c];
                }
            }
        }

        let linear_inv = Affine {
            out_rank: n,
            in_rank: n,
            linear: inv,
            translation: vec![0.0; n],
        };
        let translation = linear_inv
            .apply_vector(&self.translation)
            .into_iter()
            .map(|v| -v)
            .collect();
        Ok(Affine {
            translation,
            ..linear_inv
        })
    }

    /// Euclidean norm of output row `row`: how far that output coordinate
    /// moves per unit step of the input, for permutation/scaling transforms.
    pub fn row_norm(&self, row: usize) -> f64 {
        (0..self.in_rank)
            .map(|c| self.get(row, c).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// True when every row and every column has at most one non-zero entry.
    pub fn is_permutation_scaling(&self) -> bool {
        let rows_ok = (0..self.out_rank)
            .all(|r| (0..self.in_rank).filter(|&c| self.get(r, c) != 0.0).count() <= 1);
        let cols_ok = (0..self.in_rank)
            .all(|c| (0..self.out_rank).filter(|&r| self.get(r, c) != 0.0).count() <= 1);
        rows_ok && cols_ok
    }

    /// Embeds a square transform of lower rank into `rank` dimensions; the
    /// extra dimensions map through the identity.
    pub fn pad_to(&self, rank: usize) -> Result<Affine, MatrixError> {
        if self.out_rank != self.in_rank {
            return Err(MatrixError::NotSquare {
                out_rank: self.out_rank,
                in_rank: self.in_rank,
            });
        }
        if rank < self.in_rank {
            return Err(MatrixError::RankMismatch {
                outer_in: rank,
                inner_out: self.in_rank,
            });
        }
        let mut out = Affine::identity(rank);
        for r in 0..self.out_rank {
            for c in 0..self.in_rank {
                out.linear[r * rank + c] = self.get(r, c);
            }
            out.translation[r] = self.translation[r];
        }
        Ok(out)
    }
}
