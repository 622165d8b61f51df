//! Slice helpers for rank-generic vectors.

pub fn sub(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

pub fn distance(a: &[f64], b: &[f64]) -> f64 {
    norm(&sub(a, b))
}

/// Picks `dims` out of `v`, padding with zeros up to three components.
pub fn select3(v: &[f64], dims: &[usize]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (slot, &d) in dims.iter().take(3).enumerate() {
        out[slot] = v.get(d).copied().unwrap_or(0.0);
    }
    out
}
