//! # Principal vectors
//!
//! Dominant left singular vector(s) of an n x m data matrix `X`, computed from whichever of
//! `X X'` (n x n) or `X' X` (m x m) is smaller.
//!
//! ```text
//! n <= m:  X X' = U S S' U'      eigenvectors are U directly
//! n >  m:  X' X = V S' S V'      eigenvectors are V, and X V = U S
//! ```
//!
//! In the second case each eigenvector is mapped back through `X` and L2-normalized. Singular
//! values are the square roots of the (non-negative clamped) eigenvalues.

use anyhow::bail;
use log::{debug, info};
use rand::Rng;

use crate::dense::{column_mean, ColumnMajor, ColumnSource};
use crate::eigen::{top_one, top_two, IterationParams};
use crate::utils::{
    align_sign, normalize_in_place, orthonormalize_against, unit_orthogonal_to, FloatOps,
};

mod gram;
mod workspace;

pub use gram::{build_gram, GramSide};
pub use workspace::Workspace;

/// Tuning knobs for [`PrincipalVectors`].
#[derive(Debug, Clone, PartialEq)]
pub struct PvConfig {
    /// Refinement steps before the simultaneous iteration gives up (not an error).
    pub max_iterations: usize,
    /// Relative eigenvalue change regarded as converged.
    pub tolerance: f64,
    /// The XX' build goes parallel only with more columns than this...
    pub parallel_min_columns: usize,
    /// ...and more rows than this.
    pub parallel_min_rows: usize,
    /// Columns between progress messages in the parallel build; 0 disables them.
    pub progress_every: usize,
}

impl Default for PvConfig {
    fn default() -> Self {
        let iteration = IterationParams::default();
        Self {
            max_iterations: iteration.max_iterations,
            tolerance: iteration.tolerance,
            parallel_min_columns: 999,
            parallel_min_rows: 99,
            progress_every: 10_000,
        }
    }
}

impl PvConfig {
    fn iteration_params(&self) -> IterationParams {
        IterationParams {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
        }
    }
}

pub struct PrincipalVectorsBuilder {
    config: PvConfig,
}

impl PrincipalVectorsBuilder {
    pub fn new() -> Self {
        PrincipalVectorsBuilder {
            config: PvConfig::default(),
        }
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.config.tolerance = tolerance;
        self
    }

    pub fn parallel_min_columns(mut self, columns: usize) -> Self {
        self.config.parallel_min_columns = columns;
        self
    }

    pub fn parallel_min_rows(mut self, rows: usize) -> Self {
        self.config.parallel_min_rows = rows;
        self
    }

    pub fn progress_every(mut self, columns: usize) -> Self {
        self.config.progress_every = columns;
        self
    }

    pub fn build(self) -> PrincipalVectors {
        PrincipalVectors {
            config: self.config,
        }
    }
}

impl Default for PrincipalVectorsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Principal-vector solver.
///
/// `reference`, when given, fixes the sign of every output vector so that its dot product
/// with the reference is non-negative. `workspace` may be shared across calls (see
/// [`Workspace::for_shapes`]); without one a temporary is allocated. `rng` is only drawn
/// from to perturb the secondary trial vectors and to replace a zero start vector.
#[derive(Debug, Clone, Default)]
pub struct PrincipalVectors {
    config: PvConfig,
}

impl PrincipalVectors {
    pub fn new(config: PvConfig) -> Self {
        Self { config }
    }

    pub fn builder() -> PrincipalVectorsBuilder {
        PrincipalVectorsBuilder::new()
    }

    pub fn config(&self) -> &PvConfig {
        &self.config
    }

    /// Dominant left singular vector of `x` into `out` (length n). Returns the singular value.
    pub fn single<T, S, R>(
        &self,
        x: &S,
        reference: Option<&[T]>,
        out: &mut [T],
        workspace: Option<&mut Workspace<T>>,
        rng: &mut R,
    ) -> anyhow::Result<T>
    where
        T: FloatOps,
        S: ColumnSource<T>,
        R: Rng,
    {
        let (n, m) = (x.nrows(), x.ncols());
        check_inputs(n, m, reference, out.len())?;

        if n.min(m) == 1 {
            return Ok(rank_one(x, reference, out));
        }

        let mut local;
        let ws = match workspace {
            Some(ws) => ws,
            None => {
                local = Workspace::new(n, m);
                &mut local
            }
        };
        let parts = ws.split(n, m);
        let k = n.min(m);

        let side = gram::fill_gram(x, parts.gram, &self.config);
        if is_all_zero(parts.gram) {
            out.fill(T::zero());
            info!("{} x {} Gram matrix is all zero", k, k);
            return Ok(T::zero());
        }

        column_mean(&ColumnMajor::new(parts.gram, k, k)?, parts.seed);
        let ev = top_one(
            parts.gram,
            k,
            parts.seed,
            parts.scratch,
            &self.config.iteration_params(),
            rng,
        );

        emit(x, side, parts.seed, out);
        align_sign(out, reference);
        Ok(singular_value(ev))
    }

    /// Top two left singular vectors into `first` and `second` (each length n), and their
    /// singular values, largest first. When `min(n, m) == 1` the second pair is all zero.
    ///
    /// `second` is always orthogonal to `first`. On rank-one data any unit vector orthogonal
    /// to `first` is a valid second direction; one is picked from the coordinate axes and the
    /// second singular value comes back as (numerically) zero.
    pub fn pair<T, S, R>(
        &self,
        x: &S,
        reference: Option<&[T]>,
        first: &mut [T],
        second: &mut [T],
        workspace: Option<&mut Workspace<T>>,
        rng: &mut R,
    ) -> anyhow::Result<(T, T)>
    where
        T: FloatOps,
        S: ColumnSource<T>,
        R: Rng,
    {
        let (n, m) = (x.nrows(), x.ncols());
        check_inputs(n, m, reference, first.len())?;
        if second.len() != n {
            bail!(
                "Length of second output ({}) does not match number of rows ({})",
                second.len(),
                n
            );
        }

        if n.min(m) == 1 {
            second.fill(T::zero());
            return Ok((rank_one(x, reference, first), T::zero()));
        }

        let mut local;
        let ws = match workspace {
            Some(ws) => ws,
            None => {
                local = Workspace::new(n, m);
                &mut local
            }
        };
        let parts = ws.split(n, m);
        let k = n.min(m);

        let side = gram::fill_gram(x, parts.gram, &self.config);
        if is_all_zero(parts.gram) {
            first.fill(T::zero());
            second.fill(T::zero());
            info!("{} x {} Gram matrix is all zero", k, k);
            return Ok((T::zero(), T::zero()));
        }

        column_mean(&ColumnMajor::new(parts.gram, k, k)?, parts.seed);
        let (ev0, ev1) = top_two(
            parts.gram,
            k,
            parts.seed,
            parts.aux,
            parts.scratch,
            &self.config.iteration_params(),
            rng,
        );

        emit(x, side, parts.seed, first);
        emit(x, side, parts.aux, second);
        if orthonormalize_against(second, first) < T::epsilon().sqrt() {
            debug!("second direction of {} x {} data is degenerate", n, m);
            unit_orthogonal_to(first, second);
        }
        align_sign(first, reference);
        align_sign(second, reference);
        Ok((singular_value(ev0), singular_value(ev1)))
    }
}

/// [`PrincipalVectors::single`] with the default configuration.
pub fn principal_vector<T, S, R>(
    x: &S,
    reference: Option<&[T]>,
    out: &mut [T],
    workspace: Option<&mut Workspace<T>>,
    rng: &mut R,
) -> anyhow::Result<T>
where
    T: FloatOps,
    S: ColumnSource<T>,
    R: Rng,
{
    PrincipalVectors::default().single(x, reference, out, workspace, rng)
}

/// [`PrincipalVectors::pair`] with the default configuration.
pub fn principal_vector_pair<T, S, R>(
    x: &S,
    reference: Option<&[T]>,
    first: &mut [T],
    second: &mut [T],
    workspace: Option<&mut Workspace<T>>,
    rng: &mut R,
) -> anyhow::Result<(T, T)>
where
    T: FloatOps,
    S: ColumnSource<T>,
    R: Rng,
{
    PrincipalVectors::default().pair(x, reference, first, second, workspace, rng)
}

fn check_inputs<T>(
    n: usize,
    m: usize,
    reference: Option<&[T]>,
    out_len: usize,
) -> anyhow::Result<()> {
    if n == 0 || m == 0 {
        bail!("Cannot compute principal vectors of a {} x {} matrix", n, m);
    }
    if out_len != n {
        bail!(
            "Length of output ({}) does not match number of rows ({})",
            out_len,
            n
        );
    }
    if let Some(r) = reference {
        if r.len() != n {
            bail!(
                "Length of reference vector ({}) does not match number of rows ({})",
                r.len(),
                n
            );
        }
    }
    Ok(())
}

/// `min(n, m) == 1`: a single column is its own direction, a single row has direction +-1.
fn rank_one<T, S>(x: &S, reference: Option<&[T]>, out: &mut [T]) -> T
where
    T: FloatOps,
    S: ColumnSource<T>,
{
    if x.ncols() == 1 {
        out.copy_from_slice(x.column(0));
        let norm = normalize_in_place(out);
        align_sign(out, reference);
        if norm == T::zero() {
            info!("{} x 1 data column is all zero", x.nrows());
        }
        return norm;
    }

    let sum_sq = (0..x.ncols())
        .map(|j| {
            let v = x.column(j)[0];
            v * v
        })
        .fold(T::zero(), |acc, v| acc + v);
    let norm = sum_sq.sqrt();
    out[0] = if norm == T::zero() {
        info!("1 x {} data row is all zero", x.ncols());
        T::zero()
    } else if reference.is_some_and(|r| r[0] < T::zero()) {
        -T::one()
    } else {
        T::one()
    };
    norm
}

/// Writes the output vector for eigenvector `v` of the Gram matrix.
fn emit<T, S>(x: &S, side: GramSide, v: &[T], out: &mut [T])
where
    T: FloatOps,
    S: ColumnSource<T>,
{
    match side {
        GramSide::Rows => out.copy_from_slice(v),
        GramSide::Columns => {
            out.fill(T::zero());
            for (j, &w) in v.iter().enumerate() {
                for (o, &xi) in out.iter_mut().zip(x.column(j)) {
                    *o += xi * w;
                }
            }
            normalize_in_place(out);
        }
    }
}

fn singular_value<T: FloatOps>(ev: f64) -> T {
    T::from_f64_lossy(ev.max(0.0).sqrt())
}

fn is_all_zero<T: FloatOps>(a: &[T]) -> bool {
    a.iter().all(|&v| v == T::zero())
}
