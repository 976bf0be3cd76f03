//! # Dense column data
//!
//! The drivers see an n x m data matrix purely as a set of `m` contiguous columns of length `n`.
//! Two layouts are supported without copying:
//! - [`ColumnMajor`]: one flat buffer, element `(i, j)` at offset `i + j * n`
//! - [`ColumnSet`]: `m` independently owned column buffers

use std::marker::PhantomData;

use anyhow::{anyhow, bail};
use ndarray::ArrayView2;

use crate::utils::FloatOps;

/// Read access to an n x m matrix, one contiguous column at a time.
pub trait ColumnSource<T>: Sync {
    /// Length of every column (`n`).
    fn nrows(&self) -> usize;

    /// Number of columns (`m`).
    fn ncols(&self) -> usize;

    /// Column `j` as a slice of exactly `nrows()` values.
    fn column(&self, j: usize) -> &[T];
}

/// A flat column-major buffer.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMajor<'a, T> {
    data: &'a [T],
    nrows: usize,
    ncols: usize,
}

impl<'a, T> ColumnMajor<'a, T> {
    pub fn new(data: &'a [T], nrows: usize, ncols: usize) -> anyhow::Result<Self> {
        let expected = nrows
            .checked_mul(ncols)
            .ok_or_else(|| anyhow!("Matrix shape {} x {} overflows", nrows, ncols))?;
        if data.len() != expected {
            bail!(
                "Buffer length ({}) does not match a {} x {} matrix ({})",
                data.len(),
                nrows,
                ncols,
                expected
            );
        }
        Ok(Self { data, nrows, ncols })
    }

    /// Wraps an ndarray view whose columns are contiguous (Fortran order).
    pub fn from_view(view: ArrayView2<'a, T>) -> anyhow::Result<Self> {
        let (nrows, ncols) = view.dim();
        let data = view
            .reversed_axes()
            .to_slice()
            .ok_or_else(|| anyhow!("Array view is not stored column-major"))?;
        Self::new(data, nrows, ncols)
    }

    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }
}

impl<T: Sync> ColumnSource<T> for ColumnMajor<'_, T> {
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn ncols(&self) -> usize {
        self.ncols
    }

    #[inline]
    fn column(&self, j: usize) -> &[T] {
        &self.data[j * self.nrows..(j + 1) * self.nrows]
    }
}

/// Independently owned column buffers, each at least `nrows` long.
pub struct ColumnSet<'a, T, C> {
    columns: &'a [C],
    nrows: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T, C> ColumnSet<'a, T, C>
where
    C: AsRef<[T]>,
{
    pub fn new(columns: &'a [C], nrows: usize) -> anyhow::Result<Self> {
        if let Some((j, short)) = columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.as_ref().len() < nrows)
        {
            bail!(
                "Column {} has length {} but {} rows were requested",
                j,
                short.as_ref().len(),
                nrows
            );
        }
        Ok(Self {
            columns,
            nrows,
            _marker: PhantomData,
        })
    }
}

impl<T, C> ColumnSource<T> for ColumnSet<'_, T, C>
where
    C: AsRef<[T]> + Sync,
{
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn ncols(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    fn column(&self, j: usize) -> &[T] {
        &self.columns[j].as_ref()[..self.nrows]
    }
}

/// Column-wise mean of the `m` columns of `x`, written into `out`.
///
/// Returns the L2 norm of the mean vector; `out` itself is not normalized.
pub fn mean_vector<T, S>(x: &S, out: &mut [T]) -> anyhow::Result<T>
where
    T: FloatOps,
    S: ColumnSource<T>,
{
    let (n, m) = (x.nrows(), x.ncols());
    if n == 0 || m == 0 {
        bail!("Cannot take the mean of a {} x {} matrix", n, m);
    }
    if out.len() != n {
        bail!(
            "Length of output ({}) does not match number of rows ({})",
            out.len(),
            n
        );
    }
    Ok(column_mean(x, out))
}

/// Unchecked body of [`mean_vector`]; callers guarantee the shapes.
pub(crate) fn column_mean<T, S>(x: &S, out: &mut [T]) -> T
where
    T: FloatOps,
    S: ColumnSource<T>,
{
    out.fill(T::zero());
    for j in 0..x.ncols() {
        for (o, &v) in out.iter_mut().zip(x.column(j)) {
            *o += v;
        }
    }
    let fac = T::from_f64_lossy(x.ncols() as f64).recip();
    let mut sum = T::zero();
    for o in out.iter_mut() {
        *o = *o * fac;
        sum += *o * *o;
    }
    sum.sqrt()
}
