use log::debug;

use crate::utils::{FloatOps, ZeroVec};

/// Reusable scratch arena for the principal-vector drivers.
///
/// For an n x m problem with `k = min(n, m)` the drivers need `k * k` values for the Gram
/// matrix, two length-`k` vectors (start vector and second output) and six length-`k` vectors
/// for the simultaneous iteration. A workspace sized for the largest problem of a batch can be
/// passed to every call of that batch; a smaller one is grown on demand.
#[derive(Debug, Clone, Default)]
pub struct Workspace<T> {
    buffer: Vec<T>,
}

/// Disjoint views into a [`Workspace`] for one problem.
pub(crate) struct Parts<'a, T> {
    pub gram: &'a mut [T],
    pub seed: &'a mut [T],
    pub aux: &'a mut [T],
    pub scratch: &'a mut [T],
}

impl<T: FloatOps> Workspace<T> {
    /// Number of elements needed for an n x m problem.
    pub fn required_len(nrows: usize, ncols: usize) -> usize {
        let k = nrows.min(ncols);
        k * k + 8 * k
    }

    pub fn required_bytes(nrows: usize, ncols: usize) -> usize {
        Self::required_len(nrows, ncols) * std::mem::size_of::<T>()
    }

    pub fn new(nrows: usize, ncols: usize) -> Self {
        let mut buffer = Vec::new();
        buffer.zero_len(Self::required_len(nrows, ncols));
        Self { buffer }
    }

    /// A workspace large enough for every `(nrows, ncols)` shape in `shapes`.
    pub fn for_shapes<I>(shapes: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        let len = shapes
            .into_iter()
            .map(|(n, m)| Self::required_len(n, m))
            .max()
            .unwrap_or(0);
        let mut buffer = Vec::new();
        buffer.zero_len(len);
        Self { buffer }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub(crate) fn split(&mut self, nrows: usize, ncols: usize) -> Parts<'_, T> {
        let k = nrows.min(ncols);
        let needed = Self::required_len(nrows, ncols);
        if self.buffer.len() < needed {
            debug!(
                "Growing workspace from {} to {} elements for a {} x {} problem",
                self.buffer.len(),
                needed,
                nrows,
                ncols
            );
            self.buffer.zero_len(needed);
        }

        let (gram, rest) = self.buffer[..needed].split_at_mut(k * k);
        let (seed, rest) = rest.split_at_mut(k);
        let (aux, scratch) = rest.split_at_mut(k);
        Parts {
            gram,
            seed,
            aux,
            scratch,
        }
    }
}
