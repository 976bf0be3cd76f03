//! # Volume shears
//!
//! Rotation and translation of a sampled 3D volume through a four-way shear decomposition:
//! an optional 180 degree flip followed by four one-dimensional shears, each of which only
//! ever moves samples along a single axis. Moving a line of samples by a fractional amount is
//! delegated to a [`LineShifter`], and turning a rotation into shears to a
//! [`ShearDecomposition`]. Both are supplied by the caller.
//!
//! Volumes are `Array3` with shape `(nz, ny, nx)`, so `x` is the fastest-varying index.

use anyhow::bail;
use log::debug;
use nalgebra::{Matrix3, Vector3};
use ndarray::{s, Array3, ArrayViewMut2, Axis};
use rayon::prelude::*;

use crate::utils::FloatOps;

/// Shears whose largest displacement is below this many voxels are skipped.
const MIN_DISPLACEMENT: f64 = 1.0e-3;

/// Shifts one-dimensional lines of samples in place.
///
/// A shift of `d` moves content towards higher indices: afterwards `line[i]` holds what was
/// at position `i - d`. How fractional positions are interpolated and what enters at the
/// edges is up to the implementation.
pub trait LineShifter<T>: Sync {
    /// Shifts `a` by `shift_a` and, when given, `b` by `shift_b`. Both lines have the same
    /// length; `padded_len` is the value [`LineShifter::padded_len`] returned for it.
    fn shift_pair(
        &self,
        padded_len: usize,
        a: &mut [T],
        shift_a: f64,
        b: Option<&mut [T]>,
        shift_b: f64,
    );

    /// Working length for lines of `len` samples displaced by up to `extent` samples.
    /// Shifters that pad (for example FFT based ones) override this.
    fn padded_len(&self, len: usize, extent: f64) -> usize {
        let _ = extent;
        len
    }
}

/// Produces the flip and shears equivalent to a rigid motion.
pub trait ShearDecomposition {
    /// `voxel_size` is `[dx, dy, dz]`, already made positive. `None` if no decomposition
    /// exists for this motion.
    fn decompose(
        &self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        voxel_size: [f64; 3],
    ) -> Option<ShearSet>;
}

/// 180 degree rotation applied before the shears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flip {
    #[default]
    Identity,
    /// `x -> nx - 1 - x`, `y -> ny - 1 - y`
    XY,
    /// `x -> nx - 1 - x`, `z -> nz - 1 - z`
    XZ,
    /// `y -> ny - 1 - y`, `z -> nz - 1 - z`
    YZ,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShearAxis {
    X,
    Y,
    Z,
}

/// A shear along `axis` driven by the other two coordinates, in axis order:
///
/// ```text
/// X:  x -> x + a*y + b*z + shift
/// Y:  y -> y + a*x + b*z + shift
/// Z:  z -> z + a*x + b*y + shift
/// ```
///
/// Coordinates are measured from the centre of the volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shear {
    pub axis: ShearAxis,
    pub a: f64,
    pub b: f64,
    pub shift: f64,
}

impl Shear {
    pub fn new(axis: ShearAxis, a: f64, b: f64, shift: f64) -> Self {
        Self { axis, a, b, shift }
    }

    /// Pure translation along `axis`.
    pub fn translation(axis: ShearAxis, shift: f64) -> Self {
        Self::new(axis, 0.0, 0.0, shift)
    }

    fn is_finite(&self) -> bool {
        self.a.is_finite() && self.b.is_finite() && self.shift.is_finite()
    }

    /// Largest displacement in voxels for a volume with the given half extents.
    fn extent(&self, half: [f64; 3]) -> f64 {
        let [hx, hy, hz] = half;
        let (ha, hb) = match self.axis {
            ShearAxis::X => (hy, hz),
            ShearAxis::Y => (hx, hz),
            ShearAxis::Z => (hx, hy),
        };
        self.a.abs() * ha + self.b.abs() * hb + self.shift.abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShearSet {
    pub flip: Flip,
    pub shears: [Shear; 4],
}

impl ShearSet {
    pub fn is_valid(&self) -> bool {
        self.shears.iter().all(Shear::is_finite)
    }
}

/// Applies the flip and then the four shears of `set` to `vol`, in place.
pub fn apply_shear_set<T, S>(vol: &mut Array3<T>, set: &ShearSet, shifter: &S) -> anyhow::Result<()>
where
    T: FloatOps,
    S: LineShifter<T> + ?Sized,
{
    if !set.is_valid() {
        bail!("Shear set contains non-finite coefficients: {:?}", set.shears);
    }
    apply_flip(vol, set.flip);
    for shear in &set.shears {
        apply_shear(vol, shear, shifter);
    }
    Ok(())
}

/// Rotates and translates `vol` in place.
///
/// `voxel_size` is `[dx, dy, dz]`; zero entries are taken as 1. Every dimension of `vol`
/// must be at least 2.
pub fn rotate_volume<T, D, S>(
    vol: &mut Array3<T>,
    voxel_size: [f64; 3],
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    decomposer: &D,
    shifter: &S,
) -> anyhow::Result<()>
where
    T: FloatOps,
    D: ShearDecomposition + ?Sized,
    S: LineShifter<T> + ?Sized,
{
    let (nz, ny, nx) = vol.dim();
    if nx < 2 || ny < 2 || nz < 2 {
        bail!(
            "Cannot rotate a {} x {} x {} volume, every dimension must be at least 2",
            nx,
            ny,
            nz
        );
    }

    let voxel_size = voxel_size.map(|d| if d == 0.0 { 1.0 } else { d.abs() });
    let Some(set) = decomposer.decompose(rotation, translation, voxel_size) else {
        bail!("Can't compute shear transformation");
    };
    apply_shear_set(vol, &set, shifter)
}

fn apply_flip<T: FloatOps>(vol: &mut Array3<T>, flip: Flip) {
    let flipped = match flip {
        Flip::Identity => return,
        Flip::XY => vol.slice(s![.., ..;-1, ..;-1]).to_owned(),
        Flip::XZ => vol.slice(s![..;-1, .., ..;-1]).to_owned(),
        Flip::YZ => vol.slice(s![..;-1, ..;-1, ..]).to_owned(),
    };
    vol.assign(&flipped);
}

fn apply_shear<T, S>(vol: &mut Array3<T>, shear: &Shear, shifter: &S)
where
    T: FloatOps,
    S: LineShifter<T> + ?Sized,
{
    let (nz, ny, nx) = vol.dim();
    let half = [
        0.5 * (nx - 1) as f64,
        0.5 * (ny - 1) as f64,
        0.5 * (nz - 1) as f64,
    ];
    let [hx, hy, hz] = half;

    let extent = shear.extent(half);
    if extent < MIN_DISPLACEMENT {
        debug!("Skipping {:?} shear, displacement {:e} voxels", shear.axis, extent);
        return;
    }

    let Shear { a, b, shift, .. } = *shear;
    match shear.axis {
        // x lines of each z slab, paired over y
        ShearAxis::X => {
            let padded = shifter.padded_len(nx, extent);
            vol.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each_init(
                    || line_buffers(nx),
                    |bufs, (k, mut slab)| {
                        let offset = b * (k as f64 - hz) + shift;
                        shear_lines(&mut slab, Axis(1), offset, a, hy, padded, shifter, bufs);
                    },
                );
        }
        // y lines of each z slab, paired over x
        ShearAxis::Y => {
            let padded = shifter.padded_len(ny, extent);
            vol.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each_init(
                    || line_buffers(ny),
                    |bufs, (k, mut slab)| {
                        let offset = b * (k as f64 - hz) + shift;
                        shear_lines(&mut slab, Axis(0), offset, a, hx, padded, shifter, bufs);
                    },
                );
        }
        // z lines of each y slab, paired over x
        ShearAxis::Z => {
            let padded = shifter.padded_len(nz, extent);
            vol.axis_iter_mut(Axis(1))
                .into_par_iter()
                .enumerate()
                .for_each_init(
                    || line_buffers(nz),
                    |bufs, (j, mut slab)| {
                        let offset = b * (j as f64 - hy) + shift;
                        shear_lines(&mut slab, Axis(0), offset, a, hx, padded, shifter, bufs);
                    },
                );
        }
    }
}

fn line_buffers<T: FloatOps>(len: usize) -> (Vec<T>, Vec<T>) {
    (vec![T::zero(); len], vec![T::zero(); len])
}

/// Shifts every line of `slab` running along `along`. Line `p` moves by
/// `a * (p - center) + offset`; lines go to the shifter two at a time.
#[allow(clippy::too_many_arguments)]
fn shear_lines<T, S>(
    slab: &mut ArrayViewMut2<'_, T>,
    along: Axis,
    offset: f64,
    a: f64,
    center: f64,
    padded: usize,
    shifter: &S,
    bufs: &mut (Vec<T>, Vec<T>),
) where
    T: FloatOps,
    S: LineShifter<T> + ?Sized,
{
    let across = Axis(1 - along.index());
    let count = slab.len_of(across);
    let (first, second) = bufs;

    let mut p = 0;
    while p < count {
        let shift = a * (p as f64 - center) + offset;
        load_line(slab, across, p, first);
        if p + 1 < count {
            load_line(slab, across, p + 1, second);
            shifter.shift_pair(padded, first, shift, Some(second.as_mut_slice()), shift + a);
            store_line(slab, across, p + 1, second);
        } else {
            shifter.shift_pair(padded, first, shift, None, shift + a);
        }
        store_line(slab, across, p, first);
        p += 2;
    }
}

fn load_line<T: FloatOps>(slab: &ArrayViewMut2<'_, T>, across: Axis, p: usize, buf: &mut [T]) {
    for (dst, &src) in buf.iter_mut().zip(slab.index_axis(across, p).iter()) {
        *dst = src;
    }
}

fn store_line<T: FloatOps>(slab: &mut ArrayViewMut2<'_, T>, across: Axis, p: usize, buf: &[T]) {
    for (dst, &src) in slab.index_axis_mut(across, p).iter_mut().zip(buf) {
        *dst = src;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Rounds the shift to whole samples and fills vacated samples with zero.
    struct RoundingShifter {
        calls: AtomicUsize,
    }

    impl RoundingShifter {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        fn shift_line(line: &mut [f64], shift: f64) {
            let d = shift.round() as isize;
            let src = line.to_vec();
            for (i, v) in line.iter_mut().enumerate() {
                let from = i as isize - d;
                *v = if from >= 0 && (from as usize) < src.len() {
                    src[from as usize]
                } else {
                    0.0
                };
            }
        }
    }

    impl LineShifter<f64> for RoundingShifter {
        fn shift_pair(
            &self,
            _padded_len: usize,
            a: &mut [f64],
            shift_a: f64,
            b: Option<&mut [f64]>,
            shift_b: f64,
        ) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Self::shift_line(a, shift_a);
            if let Some(b) = b {
                Self::shift_line(b, shift_b);
            }
        }
    }

    /// Pads lines by twice the rounded-up extent and records what it was asked and handed.
    struct PaddingShifter {
        asked: AtomicUsize,
        asked_len: AtomicUsize,
        asked_extent: AtomicU64,
        granted: AtomicUsize,
        calls: AtomicUsize,
        wrong_padding: AtomicUsize,
    }

    impl PaddingShifter {
        fn new() -> Self {
            Self {
                asked: AtomicUsize::new(0),
                asked_len: AtomicUsize::new(0),
                asked_extent: AtomicU64::new(0),
                granted: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                wrong_padding: AtomicUsize::new(0),
            }
        }
    }

    impl LineShifter<f64> for PaddingShifter {
        fn shift_pair(
            &self,
            padded_len: usize,
            a: &mut [f64],
            shift_a: f64,
            b: Option<&mut [f64]>,
            shift_b: f64,
        ) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if padded_len != self.granted.load(Ordering::Relaxed) {
                self.wrong_padding.fetch_add(1, Ordering::Relaxed);
            }
            RoundingShifter::shift_line(a, shift_a);
            if let Some(b) = b {
                RoundingShifter::shift_line(b, shift_b);
            }
        }

        fn padded_len(&self, len: usize, extent: f64) -> usize {
            let padded = len + 2 * extent.ceil() as usize;
            self.asked.fetch_add(1, Ordering::Relaxed);
            self.asked_len.store(len, Ordering::Relaxed);
            self.asked_extent.store(extent.to_bits(), Ordering::Relaxed);
            self.granted.store(padded, Ordering::Relaxed);
            padded
        }
    }

    /// Turns the translation into three axis translations and ignores the rotation.
    struct TranslationOnly {
        seen_voxel_size: Cell<[f64; 3]>,
    }

    impl ShearDecomposition for TranslationOnly {
        fn decompose(
            &self,
            _rotation: &Matrix3<f64>,
            translation: &Vector3<f64>,
            voxel_size: [f64; 3],
        ) -> Option<ShearSet> {
            self.seen_voxel_size.set(voxel_size);
            Some(ShearSet {
                flip: Flip::Identity,
                shears: [
                    Shear::translation(ShearAxis::X, translation.x / voxel_size[0]),
                    Shear::translation(ShearAxis::Y, translation.y / voxel_size[1]),
                    Shear::translation(ShearAxis::Z, translation.z / voxel_size[2]),
                    Shear::translation(ShearAxis::X, 0.0),
                ],
            })
        }
    }

    struct NoDecomposition;

    impl ShearDecomposition for NoDecomposition {
        fn decompose(&self, _: &Matrix3<f64>, _: &Vector3<f64>, _: [f64; 3]) -> Option<ShearSet> {
            None
        }
    }

    fn ramp(nz: usize, ny: usize, nx: usize) -> Array3<f64> {
        Array3::from_shape_fn((nz, ny, nx), |(k, j, i)| (1 + i + 10 * j + 100 * k) as f64)
    }

    fn single(shear: Shear) -> ShearSet {
        let idle = Shear::translation(ShearAxis::X, 0.0);
        ShearSet {
            flip: Flip::Identity,
            shears: [shear, idle, idle, idle],
        }
    }

    #[test]
    fn test_flips() {
        let orig = ramp(3, 4, 5);
        let (nz, ny, nx) = orig.dim();

        let mut v = orig.clone();
        apply_flip(&mut v, Flip::XY);
        assert_eq!(v[[1, 0, 0]], orig[[1, ny - 1, nx - 1]]);
        assert_eq!(v[[2, 1, 3]], orig[[2, ny - 2, nx - 4]]);

        let mut v = orig.clone();
        apply_flip(&mut v, Flip::XZ);
        assert_eq!(v[[0, 2, 1]], orig[[nz - 1, 2, nx - 2]]);

        let mut v = orig.clone();
        apply_flip(&mut v, Flip::YZ);
        assert_eq!(v[[0, 3, 4]], orig[[nz - 1, 0, 4]]);

        for flip in [Flip::Identity, Flip::XY, Flip::XZ, Flip::YZ] {
            let mut v = orig.clone();
            apply_flip(&mut v, flip);
            apply_flip(&mut v, flip);
            assert_eq!(v, orig, "{:?}", flip);
        }
    }

    #[test]
    fn test_translation_along_x() {
        let orig = ramp(2, 3, 6);
        let mut v = orig.clone();
        let shifter = RoundingShifter::new();
        apply_shear_set(&mut v, &single(Shear::translation(ShearAxis::X, 2.0)), &shifter).unwrap();

        for ((k, j, i), &val) in v.indexed_iter() {
            let expected = if i >= 2 { orig[[k, j, i - 2]] } else { 0.0 };
            assert_eq!(val, expected);
        }
        // 3 rows per slab: one pair plus a trailing single, for each of 2 slabs
        assert_eq!(shifter.calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_x_shear_moves_rows_by_offset() {
        // ny = 3 puts the centre on row 1: rows shift by -1, 0, +1
        let orig = ramp(1, 3, 5);
        let mut v = orig.clone();
        let set = single(Shear::new(ShearAxis::X, 1.0, 0.0, 0.0));
        apply_shear_set(&mut v, &set, &RoundingShifter::new()).unwrap();

        assert_eq!(v[[0, 0, 0]], orig[[0, 0, 1]]);
        assert_eq!(v[[0, 0, 4]], 0.0);
        assert_eq!(v.slice(s![0, 1, ..]), orig.slice(s![0, 1, ..]));
        assert_eq!(v[[0, 2, 0]], 0.0);
        assert_eq!(v[[0, 2, 3]], orig[[0, 2, 2]]);
    }

    #[test]
    fn test_z_shear_uses_y_offset() {
        // z -> z + b*y: with ny = 3 and b = 1 the y = 0 column drops by one, y = 2 rises by one
        let orig = ramp(4, 3, 2);
        let mut v = orig.clone();
        let set = single(Shear::new(ShearAxis::Z, 0.0, 1.0, 0.0));
        apply_shear_set(&mut v, &set, &RoundingShifter::new()).unwrap();

        for i in 0..2 {
            assert_eq!(v[[0, 0, i]], orig[[1, 0, i]]);
            assert_eq!(v[[3, 0, i]], 0.0);
            assert_eq!(v.slice(s![.., 1, i]), orig.slice(s![.., 1, i]));
            assert_eq!(v[[0, 2, i]], 0.0);
            assert_eq!(v[[2, 2, i]], orig[[1, 2, i]]);
        }
    }

    #[test]
    fn test_y_shear_pairs_columns() {
        // y -> y + a*x with nx = 3: x = 0 moves by -2, x = 1 stays, x = 2 moves by +2
        let orig = ramp(2, 5, 3);
        let mut v = orig.clone();
        let set = single(Shear::new(ShearAxis::Y, 2.0, 0.0, 0.0));
        apply_shear_set(&mut v, &set, &RoundingShifter::new()).unwrap();

        for k in 0..2 {
            assert_eq!(v[[k, 0, 0]], orig[[k, 2, 0]]);
            assert_eq!(v.slice(s![k, .., 1]), orig.slice(s![k, .., 1]));
            assert_eq!(v[[k, 4, 2]], orig[[k, 2, 2]]);
            assert_eq!(v[[k, 1, 2]], 0.0);
        }
    }

    #[test]
    fn test_padded_len_reaches_shifter() {
        // y shear on (nz, ny, nx) = (3, 4, 5): extent = 0.5 * 2 + 0.25 * 1 + 1 = 2.25
        let mut v = ramp(3, 4, 5);
        let shifter = PaddingShifter::new();
        let set = single(Shear::new(ShearAxis::Y, 0.5, 0.25, 1.0));
        apply_shear_set(&mut v, &set, &shifter).unwrap();

        assert_eq!(shifter.asked.load(Ordering::Relaxed), 1);
        assert_eq!(shifter.asked_len.load(Ordering::Relaxed), 4);
        assert_eq!(f64::from_bits(shifter.asked_extent.load(Ordering::Relaxed)), 2.25);
        assert_eq!(shifter.granted.load(Ordering::Relaxed), 10);
        // 5 y lines per slab: two pairs plus a trailing single, for each of 3 slabs
        assert_eq!(shifter.calls.load(Ordering::Relaxed), 9);
        assert_eq!(shifter.wrong_padding.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_tiny_shear_is_skipped() {
        let orig = ramp(3, 3, 3);
        let mut v = orig.clone();
        let shifter = RoundingShifter::new();
        let tiny = Shear::new(ShearAxis::Y, 1e-5, 1e-5, 1e-5);
        apply_shear_set(&mut v, &single(tiny), &shifter).unwrap();
        assert_eq!(v, orig);
        assert_eq!(shifter.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_invalid_shear_set() {
        let mut v = ramp(2, 2, 2);
        let bad = single(Shear::new(ShearAxis::X, f64::NAN, 0.0, 0.0));
        assert!(!bad.is_valid());
        assert!(apply_shear_set(&mut v, &bad, &RoundingShifter::new()).is_err());
    }

    #[test]
    fn test_rotate_volume_translation() {
        let orig = ramp(4, 4, 4);
        let mut v = orig.clone();
        let decomposer = TranslationOnly {
            seen_voxel_size: Cell::new([0.0; 3]),
        };
        rotate_volume(
            &mut v,
            [0.0, -2.0, 1.0],
            &Matrix3::identity(),
            &Vector3::new(1.0, 2.0, 0.0),
            &decomposer,
            &RoundingShifter::new(),
        )
        .unwrap();

        assert_eq!(decomposer.seen_voxel_size.get(), [1.0, 2.0, 1.0]);
        // one voxel along x, one along y (2 mm at 2 mm voxels)
        assert_eq!(v[[0, 1, 1]], orig[[0, 0, 0]]);
        assert_eq!(v[[3, 3, 3]], orig[[3, 2, 2]]);
        assert_eq!(v[[2, 0, 2]], 0.0);
        assert_eq!(v[[2, 2, 0]], 0.0);
    }

    #[test]
    fn test_rotate_volume_errors() {
        let shifter = RoundingShifter::new();
        let decomposer = TranslationOnly {
            seen_voxel_size: Cell::new([0.0; 3]),
        };

        let mut flat = ramp(1, 4, 4);
        assert!(rotate_volume(
            &mut flat,
            [1.0; 3],
            &Matrix3::identity(),
            &Vector3::zeros(),
            &decomposer,
            &shifter
        )
        .is_err());

        let mut v = ramp(2, 2, 2);
        let orig = v.clone();
        let err = rotate_volume(
            &mut v,
            [1.0; 3],
            &Matrix3::identity(),
            &Vector3::zeros(),
            &NoDecomposition,
            &shifter,
        )
        .unwrap_err();
        assert!(err.to_string().contains("shear transformation"));
        assert_eq!(v, orig);
    }
}
