// Global pre-alignment of a moving bundle onto a static bundle

use crate::error::{ReconError, Result};
use crate::quickbundles::{Cluster, QuickBundles};
use crate::streamline::{direct_flip, resample_bundle, validate_bundle, Streamline};
use nalgebra::{Matrix3, Vector3};
use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;

/// x -> linear * x + translation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3 {
    pub linear: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for Transform3 {
    fn default() -> Self {
        Self {
            linear: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }
}

impl Transform3 {
    pub fn apply(&self, streamline: ArrayView2<f64>) -> Streamline {
        let mut out = Array2::zeros(streamline.raw_dim());
        for (p, mut q) in streamline.outer_iter().zip(out.outer_iter_mut()) {
            let v = self.linear * Vector3::new(p[0], p[1], p[2]) + self.translation;
            q[0] = v.x;
            q[1] = v.y;
            q[2] = v.z;
        }
        out
    }
}

/// moving bundle brought into the space of the static bundle
#[derive(Debug, Clone)]
pub struct Alignment {
    pub aligned: Vec<Streamline>,
    pub transform: Transform3,
}

pub trait BundleAligner: Sync {
    fn align(&self, static_bundle: &[Streamline], moving_bundle: &[Streamline]) -> Result<Alignment>;
}

/// Aligns the dominant cluster centroid of the moving bundle onto the one of the static bundle
/// with a rigid (Kabsch) or affine least-squares fit. The affine fit is ridge-regularized toward
/// the similarity solution so nearly planar centroids still give a well posed problem.
#[derive(Debug, Clone, Copy)]
pub struct CentroidAligner {
    pub affine: bool,
    /// points per streamline used for clustering and fitting
    pub n_points: usize,
    pub cluster_threshold: f64,
    /// ridge weight relative to the spread of the moving centroid
    pub ridge: f64,
}

impl Default for CentroidAligner {
    fn default() -> Self {
        Self {
            affine: true,
            n_points: 20,
            cluster_threshold: 85.,
            ridge: 1e-3,
        }
    }
}

impl CentroidAligner {
    pub fn rigid() -> Self {
        Self { affine: false, ..Default::default() }
    }

    pub fn affine() -> Self {
        Self::default()
    }

    fn dominant_centroid(&self, bundle: &[Streamline]) -> Result<Array2<f64>> {
        let resampled = resample_bundle(bundle, self.n_points)?;
        let clusters = QuickBundles::new(self.cluster_threshold)?.cluster(&resampled)?;
        // first of the largest clusters
        clusters.iter()
            .rev()
            .max_by_key(|c| c.len())
            .map(|c: &Cluster| c.centroid.clone())
            .ok_or_else(|| ReconError::degenerate("bundle produced no clusters"))
    }

    fn fit(&self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Transform3 {
        let src = points(source);
        let dst = points(target);
        let n = src.len() as f64;
        let src_mean = src.iter().sum::<Vector3<f64>>() / n;
        let dst_mean = dst.iter().sum::<Vector3<f64>>() / n;

        let mut cross = Matrix3::zeros();
        let mut spread = Matrix3::zeros();
        for (p, q) in src.iter().zip(&dst) {
            let pc = p - src_mean;
            let qc = q - dst_mean;
            cross += qc * pc.transpose();
            spread += pc * pc.transpose();
        }
        let variance = spread.trace();
        if variance == 0. {
            // a collapsed source has no recoverable orientation
            return Transform3 { linear: Matrix3::identity(), translation: dst_mean - src_mean };
        }

        let svd = cross.svd(true, true);
        let (u, v_t) = match (svd.u, svd.v_t) {
            (Some(u), Some(v_t)) => (u, v_t),
            _ => return Transform3 { linear: Matrix3::identity(), translation: dst_mean - src_mean },
        };
        let d = (u * v_t).determinant().signum();
        let reflect = Matrix3::from_diagonal(&Vector3::new(1., 1., d));
        let rotation = u * reflect * v_t;

        let linear = if self.affine {
            let scale = (svd.singular_values[0] + svd.singular_values[1] + d * svd.singular_values[2]) / variance;
            let lambda = self.ridge * variance / 3.;
            let prior = rotation * scale;
            (cross + prior * lambda)
                * (spread + Matrix3::identity() * lambda).try_inverse().unwrap_or_else(Matrix3::identity)
        } else {
            rotation
        };
        Transform3 { linear, translation: dst_mean - linear * src_mean }
    }
}

fn points(streamline: ArrayView2<f64>) -> Vec<Vector3<f64>> {
    streamline.outer_iter().map(|p| Vector3::new(p[0], p[1], p[2])).collect()
}

fn residual(t: &Transform3, source: ArrayView2<f64>, target: ArrayView2<f64>) -> f64 {
    let moved = t.apply(source);
    let (direct, _) = direct_flip(moved.view(), target);
    direct
}

impl BundleAligner for CentroidAligner {
    fn align(&self, static_bundle: &[Streamline], moving_bundle: &[Streamline]) -> Result<Alignment> {
        validate_bundle(static_bundle, "static")?;
        validate_bundle(moving_bundle, "moving")?;
        if self.n_points < 3 {
            return Err(ReconError::invalid(format!("alignment needs at least 3 points per streamline, got {}", self.n_points)));
        }
        let target = self.dominant_centroid(static_bundle)?;
        let source = self.dominant_centroid(moving_bundle)?;

        // centroids carry no orientation, try both
        let flipped = source.slice(s![..;-1, ..]);
        let direct = self.fit(source.view(), target.view());
        let reverse = self.fit(flipped, target.view());
        let transform = if residual(&reverse, flipped, target.view()) < residual(&direct, source.view(), target.view()) {
            reverse
        } else {
            direct
        };
        log::info!(
            "{} pre-alignment: translation [{:.2}, {:.2}, {:.2}]",
            if self.affine { "affine" } else { "rigid" },
            transform.translation.x, transform.translation.y, transform.translation.z
        );

        let aligned = moving_bundle.par_iter().map(|s| transform.apply(s.view())).collect();
        Ok(Alignment { aligned, transform })
    }
}
