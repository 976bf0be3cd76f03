use anyhow::bail;
use log::trace;
use nalgebra::{Matrix2, Matrix3, Vector3};
use rand::Rng;

use super::{sym_eigen_2x2, sym_eigen_3x3, PIVOT_FLOOR};
use crate::utils::{normalize_in_place, orthonormalize_against, sum_sq, FloatOps};

/// Stopping rule for the simultaneous iteration.
///
/// The iteration stops once the tracked eigenvalue(s) of the reduced 3x3 problem change by no
/// more than `tolerance * (|previous| + tolerance)` between two steps, or once
/// `max_iterations` refinement steps have been taken. Hitting the cap is not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationParams {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for IterationParams {
    fn default() -> Self {
        Self {
            max_iterations: 267,
            tolerance: 1.23456e-7,
        }
    }
}

impl IterationParams {
    fn settled(&self, current: f64, previous: f64) -> bool {
        (current - previous).abs() <= self.tolerance * (previous.abs() + self.tolerance)
    }
}

/// Dominant eigenvalue and eigenvector of the `n x n` symmetric matrix `a` (column-major).
///
/// `vec` holds the start vector on entry (a zero vector is replaced by random draws from
/// `rng`) and the unit eigenvector on return. `scratch` must hold at least `6 * n` values.
pub fn dominant_eigenpair<T, R>(
    a: &[T],
    n: usize,
    vec: &mut [T],
    scratch: &mut [T],
    params: &IterationParams,
    rng: &mut R,
) -> anyhow::Result<f64>
where
    T: FloatOps,
    R: Rng,
{
    check_shapes(a, n, vec.len(), scratch.len())?;
    Ok(top_one(a, n, vec, scratch, params, rng))
}

/// Top two eigenpairs of the `n x n` symmetric matrix `a`, largest first.
///
/// `vec` is the start vector on entry and receives the leading eigenvector; `wec` receives
/// the second one. For `n == 1` the second eigenpair is reported as zero.
pub fn dominant_eigenpairs<T, R>(
    a: &[T],
    n: usize,
    vec: &mut [T],
    wec: &mut [T],
    scratch: &mut [T],
    params: &IterationParams,
    rng: &mut R,
) -> anyhow::Result<(f64, f64)>
where
    T: FloatOps,
    R: Rng,
{
    check_shapes(a, n, vec.len(), scratch.len())?;
    if wec.len() != n {
        bail!(
            "Length of second output ({}) does not match matrix size ({})",
            wec.len(),
            n
        );
    }
    Ok(top_two(a, n, vec, wec, scratch, params, rng))
}

fn check_shapes<T>(a: &[T], n: usize, vec_len: usize, scratch_len: usize) -> anyhow::Result<()> {
    if n == 0 {
        bail!("Cannot iterate on an empty matrix");
    }
    if a.len() != n * n {
        bail!(
            "Matrix buffer length ({}) does not match a {} x {} matrix",
            a.len(),
            n,
            n
        );
    }
    if vec_len != n {
        bail!(
            "Length of start vector ({}) does not match matrix size ({})",
            vec_len,
            n
        );
    }
    if scratch_len < 6 * n {
        bail!(
            "Scratch space of {} values is too small, need {}",
            scratch_len,
            6 * n
        );
    }
    Ok(())
}

pub(crate) fn top_one<T, R>(
    a: &[T],
    n: usize,
    vec: &mut [T],
    scratch: &mut [T],
    params: &IterationParams,
    rng: &mut R,
) -> f64
where
    T: FloatOps,
    R: Rng,
{
    match n {
        1 => {
            vec[0] = T::one();
            return a[0].to_f64_lossy();
        }
        2 => {
            let eig = sym_eigen_2x2(&to_matrix2(a));
            write_column(vec, eig.vectors.column(0).iter());
            return eig.values[0];
        }
        3 => {
            let eig = sym_eigen_3x3(&to_matrix3(a));
            write_column(vec, eig.vectors.column(0).iter());
            return eig.values[0];
        }
        _ => {}
    }

    let (u, v) = scratch[..6 * n].split_at_mut(3 * n);
    seed_block(vec, u, n, rng);

    let mut previous = 0.0;
    let mut steps = 0;
    let values = loop {
        let (values, q) = ritz_step(a, n, u, v);
        recombine(u, v, n, &q, rng);

        if steps > 0 && params.settled(values[0], previous) {
            trace!("simultaneous iteration settled after {} steps", steps);
            break values;
        }
        if steps >= params.max_iterations {
            trace!("simultaneous iteration stopped at the cap of {} steps", steps);
            break values;
        }
        previous = values[0];
        steps += 1;
    };

    vec.copy_from_slice(&u[..n]);
    values[0]
}

pub(crate) fn top_two<T, R>(
    a: &[T],
    n: usize,
    vec: &mut [T],
    wec: &mut [T],
    scratch: &mut [T],
    params: &IterationParams,
    rng: &mut R,
) -> (f64, f64)
where
    T: FloatOps,
    R: Rng,
{
    match n {
        1 => {
            vec[0] = T::one();
            wec[0] = T::zero();
            return (a[0].to_f64_lossy(), 0.0);
        }
        2 => {
            let eig = sym_eigen_2x2(&to_matrix2(a));
            write_column(vec, eig.vectors.column(0).iter());
            write_column(wec, eig.vectors.column(1).iter());
            return (eig.values[0], eig.values[1]);
        }
        3 => {
            let eig = sym_eigen_3x3(&to_matrix3(a));
            write_column(vec, eig.vectors.column(0).iter());
            write_column(wec, eig.vectors.column(1).iter());
            return (eig.values[0], eig.values[1]);
        }
        _ => {}
    }

    let (u, v) = scratch[..6 * n].split_at_mut(3 * n);
    seed_block(vec, u, n, rng);

    let mut previous = [0.0, 0.0];
    let mut steps = 0;
    let values = loop {
        let (values, q) = ritz_step(a, n, u, v);
        recombine(u, v, n, &q, rng);

        if steps > 0
            && params.settled(values[0], previous[0])
            && params.settled(values[1], previous[1])
        {
            trace!("paired simultaneous iteration settled after {} steps", steps);
            break values;
        }
        if steps >= params.max_iterations {
            trace!("paired simultaneous iteration stopped at the cap of {} steps", steps);
            break values;
        }
        previous = [values[0], values[1]];
        steps += 1;
    };

    vec.copy_from_slice(&u[..n]);
    wec.copy_from_slice(&u[n..2 * n]);
    (values[0], values[1])
}

/// Fills the three trial vectors in `u`: the normalized start vector, then two copies with
/// random sign flips and a small random offset per entry.
fn seed_block<T, R>(start: &[T], u: &mut [T], n: usize, rng: &mut R)
where
    T: FloatOps,
    R: Rng,
{
    let (u1, rest) = u.split_at_mut(n);
    let (u2, u3) = rest.split_at_mut(n);

    u1.copy_from_slice(start);
    if sum_sq(u1) == T::zero() {
        for x in u1.iter_mut() {
            *x = T::from_f64_lossy(rng.random::<f64>() - 0.3);
        }
    }
    normalize_in_place(u1);

    let jitter = 0.02468 / n as f64;
    for i in 0..n {
        let bits: u32 = rng.random();
        let d2 = T::from_f64_lossy(jitter * (((bits >> 1) % 4) as f64 - 1.5));
        let d3 = T::from_f64_lossy(jitter * (((bits >> 5) % 4) as f64 - 1.5));
        let x = u1[i];
        u2[i] = (if (bits >> 3) & 1 == 0 { x } else { -x }) + d2;
        u3[i] = (if (bits >> 7) & 1 == 0 { x } else { -x }) + d3;
    }
}

/// One Rayleigh-Ritz step: `V = A U`, then the eigenproblem of `U'AU` relative to `U'U`.
///
/// Returns the reduced eigenvalues and the weights `Q` such that the refined vectors are the
/// columns of `V Q`.
fn ritz_step<T: FloatOps>(
    a: &[T],
    n: usize,
    u: &[T],
    v: &mut [T],
) -> (Vector3<f64>, Matrix3<f64>) {
    apply(a, n, u, v);

    let mut g = [[0.0f64; 3]; 3];
    let mut h = [[0.0f64; 3]; 3];
    for i in 0..n {
        let uu = [
            u[i].to_f64_lossy(),
            u[n + i].to_f64_lossy(),
            u[2 * n + i].to_f64_lossy(),
        ];
        let vv = [
            v[i].to_f64_lossy(),
            v[n + i].to_f64_lossy(),
            v[2 * n + i].to_f64_lossy(),
        ];
        for r in 0..3 {
            for c in r..3 {
                g[r][c] += uu[r] * uu[c];
                h[r][c] += uu[r] * vv[c];
            }
        }
    }

    let linv = inverse_cholesky_factor(&g);
    let h = Matrix3::new(
        h[0][0], h[0][1], h[0][2], //
        h[0][1], h[1][1], h[1][2], //
        h[0][2], h[1][2], h[2][2],
    );
    let b = linv * h * linv.transpose();
    let eig = sym_eigen_3x3(&b);

    (eig.values, linv.transpose() * eig.vectors)
}

/// `V = A U` for the three trial vectors stored back to back.
fn apply<T: FloatOps>(a: &[T], n: usize, u: &[T], v: &mut [T]) {
    v.fill(T::zero());
    for (j, aj) in a.chunks_exact(n).enumerate() {
        let weights = [u[j], u[n + j], u[2 * n + j]];
        for (vc, &w) in v.chunks_exact_mut(n).zip(weights.iter()) {
            for (vi, &aij) in vc.iter_mut().zip(aj) {
                *vi += aij * w;
            }
        }
    }
}

/// Cholesky-factors the 3x3 Gram matrix `g` (upper triangle used) and returns the inverse of
/// the lower factor. Non-positive pivots are replaced by a small floor.
fn inverse_cholesky_factor(g: &[[f64; 3]; 3]) -> Matrix3<f64> {
    let pivot = |d: f64| if d <= 0.0 { PIVOT_FLOOR } else { d.sqrt() };

    let l11 = pivot(g[0][0]);
    let l21 = g[0][1] / l11;
    let l22 = pivot(g[1][1] - l21 * l21);
    let l31 = g[0][2] / l11;
    let l32 = (g[1][2] - l21 * l31) / l22;
    let l33 = pivot(g[2][2] - l31 * l31 - l32 * l32);

    Matrix3::new(
        1.0 / l11,
        0.0,
        0.0,
        -l21 / (l11 * l22),
        1.0 / l22,
        0.0,
        (l21 * l32 - l22 * l31) / (l11 * l22 * l33),
        -l32 / (l22 * l33),
        1.0 / l33,
    )
}

/// `U = V Q`, orthonormalized column by column.
///
/// On rank-deficient input the columns of `V` can all point the same way. A column with less
/// than `sqrt(epsilon)` of its length outside the earlier ones is redrawn from `rng`.
fn recombine<T, R>(u: &mut [T], v: &[T], n: usize, q: &Matrix3<f64>, rng: &mut R)
where
    T: FloatOps,
    R: Rng,
{
    let (v1, rest) = v.split_at(n);
    let (v2, v3) = rest.split_at(n);
    let floor = T::epsilon().sqrt();

    for c in 0..3 {
        let (done, tail) = u.split_at_mut(c * n);
        let uc = &mut tail[..n];
        let w1 = T::from_f64_lossy(q[(0, c)]);
        let w2 = T::from_f64_lossy(q[(1, c)]);
        let w3 = T::from_f64_lossy(q[(2, c)]);
        for i in 0..n {
            uc[i] = w1 * v1[i] + w2 * v2[i] + w3 * v3[i];
        }
        if orthonormalize_against(uc, done) < floor {
            trace!("trial vector {} collapsed, redrawing", c);
            for x in uc.iter_mut() {
                *x = T::from_f64_lossy(rng.random::<f64>() - 0.5);
            }
            orthonormalize_against(uc, done);
        }
    }
}

fn to_matrix2<T: FloatOps>(a: &[T]) -> Matrix2<f64> {
    Matrix2::from_iterator(a.iter().map(|x| x.to_f64_lossy()))
}

fn to_matrix3<T: FloatOps>(a: &[T]) -> Matrix3<f64> {
    Matrix3::from_iterator(a.iter().map(|x| x.to_f64_lossy()))
}

fn write_column<'a, T: FloatOps>(out: &mut [T], col: impl Iterator<Item = &'a f64>) {
    for (o, &x) in out.iter_mut().zip(col) {
        *o = T::from_f64_lossy(x);
    }
}
