use std::cmp::Ordering;
use std::fmt::Debug;
use std::iter::Sum;
use std::ops::AddAssign;

use num_traits::Float;

/// Floating point element type accepted by the data matrices and drivers.
///
/// The heavy per-element work (Gram accumulation, matrix-vector products) runs in `Self`,
/// while the small reductions feeding the 3x3 eigensolver are carried out in `f64`.
pub trait FloatOps: Float + Default + AddAssign + Sum + Debug + Send + Sync + 'static {
    fn to_f64_lossy(self) -> f64;
    fn from_f64_lossy(v: f64) -> Self;
}

impl FloatOps for f32 {
    #[inline]
    fn to_f64_lossy(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64_lossy(v: f64) -> Self {
        v as f32
    }
}

impl FloatOps for f64 {
    #[inline]
    fn to_f64_lossy(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64_lossy(v: f64) -> Self {
        v
    }
}

pub trait ZeroVec {
    fn zero_len(&mut self, len: usize);
}

impl<T: Default + Clone> ZeroVec for Vec<T> {
    fn zero_len(&mut self, len: usize) {
        self.clear();
        self.reserve(len);
        self.extend(std::iter::repeat_n(T::default(), len));
    }
}

pub(crate) fn dot<T: FloatOps>(a: &[T], b: &[T]) -> T {
    a.iter()
        .zip(b.iter())
        .fold(T::zero(), |acc, (&x, &y)| acc + x * y)
}

pub(crate) fn sum_sq<T: FloatOps>(a: &[T]) -> T {
    a.iter().fold(T::zero(), |acc, &x| acc + x * x)
}

/// Scales `v` to unit length and returns the original norm. A zero vector is left untouched.
pub(crate) fn normalize_in_place<T: FloatOps>(v: &mut [T]) -> T {
    let norm = sum_sq(v).sqrt();
    if norm > T::zero() {
        let inv = norm.recip();
        v.iter_mut().for_each(|x| *x = *x * inv);
    }
    norm
}

/// Projects the unit vectors stored back to back in `basis` out of `v`, twice, and rescales
/// what is left to unit length. Returns the norm of the remainder relative to the norm of `v`
/// on entry, so zero means `v` was zero or lay in the span of `basis`.
pub(crate) fn orthonormalize_against<T: FloatOps>(v: &mut [T], basis: &[T]) -> T {
    if normalize_in_place(v) == T::zero() {
        return T::zero();
    }
    for _ in 0..2 {
        for b in basis.chunks_exact(v.len()) {
            let c = dot(b, v);
            v.iter_mut().zip(b).for_each(|(x, &y)| *x = *x - c * y);
        }
    }
    normalize_in_place(v)
}

/// Fills `out` with a unit vector orthogonal to the unit vector `u`, built from the coordinate
/// axis on which `u` is smallest. Needs `u.len() >= 2`.
pub(crate) fn unit_orthogonal_to<T: FloatOps>(u: &[T], out: &mut [T]) {
    let axis = u
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.abs().partial_cmp(&b.abs()).unwrap_or(Ordering::Equal))
        .map_or(0, |(j, _)| j);
    out.fill(T::zero());
    out[axis] = T::one();
    orthonormalize_against(out, u);
}

/// Negates `v` when its dot product with `reference` is negative.
pub(crate) fn align_sign<T: FloatOps>(v: &mut [T], reference: Option<&[T]>) {
    if let Some(r) = reference {
        if dot(r, v) < T::zero() {
            v.iter_mut().for_each(|x| *x = -*x);
        }
    }
}
