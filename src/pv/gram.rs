use anyhow::bail;
use log::{debug, info};
use rayon::prelude::*;

use super::PvConfig;
use crate::dense::ColumnSource;
use crate::utils::{dot, FloatOps};

/// Number of data columns accumulated per parallel sweep over the packed triangle.
const COLUMN_BLOCK: usize = 64;

/// Which of the two equivalent Gram matrices of an n x m matrix `X` was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GramSide {
    /// `X X'`, n x n. Used when `n <= m`; its eigenvectors are the left singular vectors.
    Rows,
    /// `X' X`, m x m. Used when `n > m`; its eigenvectors must be mapped back through `X`.
    Columns,
}

impl GramSide {
    pub fn for_shape(nrows: usize, ncols: usize) -> Self {
        if nrows > ncols {
            GramSide::Columns
        } else {
            GramSide::Rows
        }
    }
}

/// Builds the smaller Gram matrix of `x` into `out` (column-major, `k * k` with
/// `k = min(n, m)`) using the default thresholds, and reports which one it built.
pub fn build_gram<T, S>(x: &S, out: &mut [T]) -> anyhow::Result<GramSide>
where
    T: FloatOps,
    S: ColumnSource<T>,
{
    let (n, m) = (x.nrows(), x.ncols());
    if n == 0 || m == 0 {
        bail!("Cannot build the Gram matrix of a {} x {} matrix", n, m);
    }
    let k = n.min(m);
    if out.len() != k * k {
        bail!(
            "Gram buffer length ({}) does not match a {} x {} matrix",
            out.len(),
            k,
            k
        );
    }
    Ok(fill_gram(x, out, &PvConfig::default()))
}

pub(crate) fn fill_gram<T, S>(x: &S, gram: &mut [T], config: &PvConfig) -> GramSide
where
    T: FloatOps,
    S: ColumnSource<T>,
{
    let (n, m) = (x.nrows(), x.ncols());
    let side = GramSide::for_shape(n, m);
    match side {
        GramSide::Columns => {
            debug!("Building {} x {} X'X from {} rows", m, m, n);
            fill_cross_columns(x, gram);
        }
        GramSide::Rows => {
            debug!("Building {} x {} XX' from {} columns", n, n, m);
            let packed_len = n * (n + 1) / 2;
            let packed = &mut gram[..packed_len];
            packed.fill(T::zero());
            if m > config.parallel_min_columns && n > config.parallel_min_rows {
                accumulate_packed_parallel(x, packed, config.progress_every);
            } else {
                accumulate_packed(x, packed);
            }
            unpack_lower(gram, n);
        }
    }
    side
}

/// `X' X`, one dot product per lower-triangle entry, mirrored as it goes.
fn fill_cross_columns<T, S>(x: &S, gram: &mut [T])
where
    T: FloatOps,
    S: ColumnSource<T>,
{
    let m = x.ncols();
    for j in 0..m {
        let cj = x.column(j);
        for k in 0..=j {
            let v = dot(cj, x.column(k));
            gram[j + k * m] = v;
            gram[k + j * m] = v;
        }
    }
}

/// Row `j` and column `k <= j` of entry `q` of a row-packed lower triangle.
pub(crate) fn tri_coords(q: usize) -> (usize, usize) {
    let mut j = (((8.0 * q as f64 + 1.000001).sqrt() - 0.999999) * 0.5) as usize;
    while j * (j + 1) / 2 > q {
        j -= 1;
    }
    while (j + 1) * (j + 2) / 2 <= q {
        j += 1;
    }
    (j, q - j * (j + 1) / 2)
}

fn accumulate_packed<T, S>(x: &S, packed: &mut [T])
where
    T: FloatOps,
    S: ColumnSource<T>,
{
    for c in 0..x.ncols() {
        let col = x.column(c);
        let mut q = 0;
        for (j, &xj) in col.iter().enumerate() {
            for &xk in &col[..=j] {
                packed[q] += xj * xk;
                q += 1;
            }
        }
    }
}

/// Same sums as [`accumulate_packed`], in the same order per entry, with the entries of the
/// packed triangle spread over the rayon pool.
fn accumulate_packed_parallel<T, S>(x: &S, packed: &mut [T], progress_every: usize)
where
    T: FloatOps,
    S: ColumnSource<T>,
{
    let (n, m) = (x.nrows(), x.ncols());
    info!(
        "Building {} x {} XX' over {} columns on {} threads",
        n,
        n,
        m,
        rayon::current_num_threads()
    );

    let mut start = 0;
    while start < m {
        let end = (start + COLUMN_BLOCK).min(m);
        let block: Vec<&[T]> = (start..end).map(|c| x.column(c)).collect();

        packed.par_iter_mut().enumerate().for_each(|(q, entry)| {
            let (j, k) = tri_coords(q);
            for col in &block {
                *entry += col[j] * col[k];
            }
        });

        if progress_every > 0 && end / progress_every > start / progress_every {
            info!("Gram build: {} of {} columns done", end, m);
        }
        start = end;
    }
}

/// Expands the row-packed lower triangle at the front of `gram` into a full symmetric
/// n x n column-major matrix.
fn unpack_lower<T: FloatOps>(gram: &mut [T], n: usize) {
    // Row j of the packed triangle becomes the top j + 1 entries of column j. Working from
    // the last row down keeps every source ahead of its destination.
    for j in (0..n).rev() {
        let src = j * (j + 1) / 2;
        gram.copy_within(src..src + j + 1, j * n);
    }
    for c in 0..n {
        for r in c + 1..n {
            gram[r + c * n] = gram[c + r * n];
        }
    }
}
