// Streamline geometry: arc length, resampling, flattening and the minimum direct-flip distance

use crate::error::{ReconError, Result};
use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

/// an ordered (N x 3) sequence of points
pub type Streamline = Array2<f64>;

/// checks that every streamline of a bundle is a finite, non-empty (N x 3) array
pub fn validate_bundle(bundle: &[Streamline], name: &str) -> Result<()> {
    if bundle.is_empty() {
        return Err(ReconError::degenerate(format!("{name} bundle has no streamlines")));
    }
    for (i, s) in bundle.iter().enumerate() {
        if s.ncols() != 3 || s.nrows() == 0 {
            return Err(ReconError::invalid(format!(
                "{name} streamline {i} must be a non-empty (N x 3) array, got {:?}", s.dim()
            )));
        }
        if s.iter().any(|x| !x.is_finite()) {
            return Err(ReconError::invalid(format!("{name} streamline {i} has non-finite points")));
        }
    }
    Ok(())
}

#[inline]
fn dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let d0 = a[0] - b[0];
    let d1 = a[1] - b[1];
    let d2 = a[2] - b[2];
    (d0 * d0 + d1 * d1 + d2 * d2).sqrt()
}

/// segment lengths between consecutive points
fn segment_lengths(streamline: ArrayView2<f64>) -> Vec<f64> {
    streamline.outer_iter()
        .zip(streamline.outer_iter().skip(1))
        .map(|(a, b)| dist(a, b))
        .collect()
}

/// arc length of a streamline
pub fn length(streamline: ArrayView2<f64>) -> f64 {
    segment_lengths(streamline).iter().sum()
}

/// resamples a streamline to n points equally spaced along its arc length. The end points are kept.
pub fn set_number_of_points(streamline: ArrayView2<f64>, n: usize) -> Result<Streamline> {
    if n < 2 {
        return Err(ReconError::invalid(format!("cannot resample a streamline to {n} points")));
    }
    if streamline.ncols() != 3 || streamline.nrows() == 0 {
        return Err(ReconError::invalid(format!("expected an (N x 3) streamline, got {:?}", streamline.dim())));
    }
    let seg = segment_lengths(streamline);
    let total: f64 = seg.iter().sum();
    let mut out = Array2::zeros((n, 3));
    if total == 0. {
        // all points coincide
        for mut row in out.outer_iter_mut() {
            row.assign(&streamline.row(0));
        }
        return Ok(out);
    }

    let step = total / (n - 1) as f64;
    let mut k = 0;
    let mut travelled = 0.;
    for (i, mut row) in out.outer_iter_mut().enumerate() {
        let target = (i as f64 * step).min(total);
        while k < seg.len() - 1 && travelled + seg[k] < target {
            travelled += seg[k];
            k += 1;
        }
        let t = if seg[k] > 0. { ((target - travelled) / seg[k]).clamp(0., 1.) } else { 0. };
        let a = streamline.row(k);
        let b = streamline.row(k + 1);
        for d in 0..3 {
            row[d] = a[d] + t * (b[d] - a[d]);
        }
    }
    out.row_mut(n - 1).assign(&streamline.row(streamline.nrows() - 1));
    Ok(out)
}

/// resamples every streamline of a bundle to n points
pub fn resample_bundle(bundle: &[Streamline], n: usize) -> Result<Vec<Streamline>> {
    bundle.par_iter().map(|s| set_number_of_points(s.view(), n)).collect()
}

/// concatenates the points of a bundle into one (P x 3) array and returns the offset of each
/// streamline's first point
pub fn unlist_streamlines(bundle: &[Streamline]) -> (Array2<f64>, Vec<usize>) {
    let total = bundle.iter().map(|s| s.nrows()).sum();
    let mut points = Array2::zeros((total, 3));
    let mut offsets = Vec::with_capacity(bundle.len());
    let mut start = 0;
    for s in bundle {
        offsets.push(start);
        points.slice_mut(s![start..start + s.nrows(), ..]).assign(s);
        start += s.nrows();
    }
    (points, offsets)
}

/// average point-wise distance, direct and flipped
pub(crate) fn direct_flip(a: ArrayView2<f64>, b: ArrayView2<f64>) -> (f64, f64) {
    let n = a.nrows();
    let mut direct = 0.;
    let mut flipped = 0.;
    for i in 0..n {
        direct += dist(a.row(i), b.row(i));
        flipped += dist(a.row(i), b.row(n - 1 - i));
    }
    (direct / n as f64, flipped / n as f64)
}

/// minimum direct-flip distance between two streamlines with the same number of points
pub fn mdf(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<f64> {
    if a.dim() != b.dim() || a.ncols() != 3 || a.nrows() == 0 {
        return Err(ReconError::invalid(format!(
            "mdf needs two (N x 3) streamlines of equal length, got {:?} and {:?}", a.dim(), b.dim()
        )));
    }
    let (direct, flipped) = direct_flip(a, b);
    Ok(direct.min(flipped))
}

/// pairwise mdf distances with rows indexing the static bundle and columns the moving bundle
pub fn distance_matrix_mdf(static_bundle: &[Streamline], moving_bundle: &[Streamline]) -> Result<Array2<f64>> {
    validate_bundle(static_bundle, "static")?;
    validate_bundle(moving_bundle, "moving")?;
    let n_points = static_bundle[0].nrows();
    if let Some(s) = static_bundle.iter().chain(moving_bundle).find(|s| s.nrows() != n_points) {
        return Err(ReconError::invalid(format!(
            "all streamlines need {n_points} points for the mdf distance, found one with {}", s.nrows()
        )));
    }
    let mut d = Array2::zeros((static_bundle.len(), moving_bundle.len()));
    d.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(static_bundle.par_iter())
        .for_each(|(mut row, a)| {
            for (x, b) in row.iter_mut().zip(moving_bundle) {
                let (direct, flipped) = direct_flip(a.view(), b.view());
                *x = direct.min(flipped);
            }
        });
    Ok(d)
}
