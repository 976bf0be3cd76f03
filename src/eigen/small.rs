use std::f64::consts::PI;

use log::debug;
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

use super::{DIAGONAL_EPS, PIVOT_FLOOR};

/// Eigen-decomposition of a symmetric 3x3 matrix.
///
/// `values` are sorted descending; column `i` of `vectors` belongs to `values[i]` and the
/// vector matrix is a proper rotation (determinant +1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymEigen3 {
    pub values: Vector3<f64>,
    pub vectors: Matrix3<f64>,
}

/// Eigen-decomposition of a symmetric 2x2 matrix, same conventions as [`SymEigen3`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymEigen2 {
    pub values: Vector2<f64>,
    pub vectors: Matrix2<f64>,
}

/// Eigenvalues and eigenvectors of a symmetric 3x3 matrix.
///
/// Only the lower triangle of `a` is read.
pub fn sym_eigen_3x3(a: &Matrix3<f64>) -> SymEigen3 {
    let (values, vectors) = solve_3x3(a, true);
    SymEigen3 {
        values,
        vectors: vectors.unwrap_or_else(Matrix3::identity),
    }
}

/// Eigenvalues (descending) of a symmetric 3x3 matrix, skipping the eigenvectors.
pub fn sym_eigenvalues_3x3(a: &Matrix3<f64>) -> Vector3<f64> {
    solve_3x3(a, false).0
}

/// Eigenvalues and eigenvectors of a symmetric 2x2 matrix.
pub fn sym_eigen_2x2(a: &Matrix2<f64>) -> SymEigen2 {
    let (sxx, sxy, syy) = (a[(0, 0)], a[(1, 0)], a[(1, 1)]);
    let small = sxx.abs().min(syy.abs());

    if sxy == 0.0 || sxy.abs() < DIAGONAL_EPS * small {
        return if sxx >= syy {
            SymEigen2 {
                values: Vector2::new(sxx, syy),
                vectors: Matrix2::identity(),
            }
        } else {
            SymEigen2 {
                values: Vector2::new(syy, sxx),
                vectors: Matrix2::new(0.0, -1.0, 1.0, 0.0),
            }
        };
    }

    let ss = ((sxx - syy) * (sxx - syy) + 4.0 * sxy * sxy).sqrt();
    let lam1 = 0.5 * (sxx + syy + ss);
    let lam2 = 0.5 * (sxx + syy - ss);

    // (A - lam1 I) v = 0; pick the row form without cancellation
    let v = if sxx >= syy {
        Vector2::new(sxx - syy + ss, 2.0 * sxy)
    } else {
        Vector2::new(2.0 * sxy, syy - sxx + ss)
    }
    .normalize();

    SymEigen2 {
        values: Vector2::new(lam1, lam2),
        vectors: Matrix2::new(v.x, -v.y, v.y, v.x),
    }
}

/// Eigenvalues (descending) of a symmetric 2x2 matrix.
pub fn sym_eigenvalues_2x2(a: &Matrix2<f64>) -> Vector2<f64> {
    sym_eigen_2x2(a).values
}

fn solve_3x3(a: &Matrix3<f64>, want_vectors: bool) -> (Vector3<f64>, Option<Matrix3<f64>>) {
    let (aa, bb, cc) = (a[(0, 0)], a[(1, 0)], a[(2, 0)]);
    let (dd, ee, ff) = (a[(1, 1)], a[(2, 1)], a[(2, 2)]);

    let (aba, abb, abc) = (aa.abs(), bb.abs(), cc.abs());
    let (abd, abe, abf) = (dd.abs(), ee.abs(), ff.abs());
    let ann = aba + abb + abc + abd + abe + abf;

    if ann == 0.0 {
        return (Vector3::zeros(), want_vectors.then(Matrix3::identity));
    }

    if abb + abc + abe == 0.0
        || (DIAGONAL_EPS * aba > abb + abc
            && DIAGONAL_EPS * abd > abb + abe
            && DIAGONAL_EPS * abf > abc + abe)
    {
        return diagonal_3x3([aa, dd, ff], want_vectors);
    }

    // scale so the absolute entry sum is 1, undone on the way out
    let s = ann.recip();
    let m = Scaled {
        aa: aa * s,
        bb: bb * s,
        cc: cc * s,
        dd: dd * s,
        ee: ee * s,
        ff: ff * s,
    };

    // characteristic polynomial x^3 + a1 x^2 + a2 x + a3
    let a1 = -(m.aa + m.dd + m.ff);
    let a2 = m.aa * m.ff + m.aa * m.dd + m.dd * m.ff - m.bb * m.bb - m.cc * m.cc - m.ee * m.ee;
    let a3 = m.aa * (m.ee * m.ee - m.dd * m.ff)
        + m.bb * (m.bb * m.ff - m.cc * m.ee)
        + m.cc * (m.cc * m.dd - m.bb * m.ee);

    let qq = (0.5 * ((m.dd - m.aa).powi(2) + (m.ff - m.aa).powi(2) + (m.ff - m.dd).powi(2))
        + 3.0 * (m.bb * m.bb + m.cc * m.cc + m.ee * m.ee))
        / 9.0;
    let rr = (2.0 * a1 * a1 * a1 - 9.0 * a1 * a2 + 27.0 * a3) / 54.0;

    let (qs, rr) = if qq <= 0.0 {
        debug!("symmetric 3x3 solve: discriminant {} <= 0 (numerator {}), clamped", qq, rr);
        (0.0, 0.0)
    } else {
        let qs = qq.sqrt();
        (qs, (rr / (qs * qq)).clamp(-1.0, 1.0))
    };
    let th = rr.acos();

    let mut lam = [
        -2.0 * qs * (th / 3.0).cos() - a1 / 3.0,
        -2.0 * qs * ((th + 2.0 * PI) / 3.0).cos() - a1 / 3.0,
        -2.0 * qs * ((th + 4.0 * PI) / 3.0).cos() - a1 / 3.0,
    ];

    if !want_vectors {
        sort_desc(&mut lam);
        return (Vector3::new(lam[0], lam[1], lam[2]) * ann, None);
    }

    let d12 = (lam[0] - lam[1]).abs();
    let d13 = (lam[0] - lam[2]).abs();
    let d23 = (lam[1] - lam[2]).abs();

    if d12.min(d13).min(d23) > DIAGONAL_EPS {
        sort_desc(&mut lam);

        let v0 = m.null_vector(lam[0]);
        let v1 = m.null_vector(lam[1]);
        let v1 = (v1 - v0 * v0.dot(&v1)).normalize();
        let v2 = v0.cross(&v1);

        let values = Vector3::new(lam[0], lam[1], lam[2]) * ann;
        return (values, Some(Matrix3::from_columns(&[v0, v1, v2])));
    }

    // double root: move the outlier to lam[2] and merge the pair
    if d13 < d12 && d13 < d23 {
        lam.swap(1, 2);
    } else if d23 < d12 && d23 < d13 {
        lam.swap(0, 2);
    }
    let pair = 0.5 * (lam[0] + lam[1]);
    let outlier = lam[2];

    let w = m.null_vector(outlier);
    let p = orthogonal_to(&w);
    let q = w.cross(&p);

    let mut vectors = Matrix3::from_columns(&[p, q, w]);
    let mut values = Vector3::new(pair, pair, outlier);
    if pair < outlier {
        values.swap_rows(0, 2);
        vectors.swap_columns(0, 2);
    }
    fix_orientation(&mut vectors);

    (values * ann, Some(vectors))
}

/// Lower triangle of a scaled symmetric 3x3 matrix.
struct Scaled {
    aa: f64,
    bb: f64,
    cc: f64,
    dd: f64,
    ee: f64,
    ff: f64,
}

impl Scaled {
    /// Unit vector in the null space of (A - lam I), built as the cross product of two of its
    /// rows. Falls back to the other row pairs when a pair is nearly parallel.
    fn null_vector(&self, lam: f64) -> Vector3<f64> {
        let u = Vector3::new(self.aa - lam, self.bb, self.cc);
        let v = Vector3::new(self.bb, self.dd - lam, self.ee);
        let w = Vector3::new(self.cc, self.ee, self.ff - lam);

        let candidates = [u.cross(&v), u.cross(&w), v.cross(&w)];
        let t = candidates
            .iter()
            .find(|t| t.norm() >= PIVOT_FLOOR)
            .copied()
            .unwrap_or_else(|| {
                candidates
                    .iter()
                    .copied()
                    .max_by(|x, y| x.norm_squared().total_cmp(&y.norm_squared()))
                    .unwrap_or_else(Vector3::x)
            });

        let tn = t.norm();
        if tn > 0.0 {
            t / tn
        } else {
            Vector3::x()
        }
    }
}

/// Some unit vector orthogonal to the unit vector `w`.
fn orthogonal_to(w: &Vector3<f64>) -> Vector3<f64> {
    let axes = [Vector3::x(), Vector3::y(), Vector3::z()];
    let mut t = w.cross(&axes[0]);
    for axis in &axes[1..] {
        if t.norm() >= PIVOT_FLOOR {
            break;
        }
        t = w.cross(axis);
    }
    t.normalize()
}

fn diagonal_3x3(diag: [f64; 3], want_vectors: bool) -> (Vector3<f64>, Option<Matrix3<f64>>) {
    let mut lam = diag;
    let mut vectors = Matrix3::identity();

    for (i, j) in [(0, 1), (0, 2), (1, 2)] {
        if lam[i] < lam[j] {
            lam.swap(i, j);
            vectors.swap_columns(i, j);
        }
    }
    fix_orientation(&mut vectors);

    (
        Vector3::new(lam[0], lam[1], lam[2]),
        want_vectors.then_some(vectors),
    )
}

fn fix_orientation(vectors: &mut Matrix3<f64>) {
    if vectors.determinant() < 0.0 {
        let neg = -vectors.column(2).into_owned();
        vectors.set_column(2, &neg);
    }
}

fn sort_desc(lam: &mut [f64; 3]) {
    for (i, j) in [(0, 1), (0, 2), (1, 2)] {
        if lam[i] < lam[j] {
            lam.swap(i, j);
        }
    }
}
