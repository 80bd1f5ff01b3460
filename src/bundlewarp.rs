// BundleWarp: nonlinear registration of a moving bundle onto a static bundle by pairing streamlines
// and deforming each moving streamline onto its static partner

use crate::alignment::{BundleAligner, CentroidAligner};
use crate::correspondence::{match_streamlines, Correspondence};
use crate::error::{ReconError, Result};
use crate::quickbundles::QuickBundles;
use crate::registration::{CoherentPointDrift, DeformationParams, PointSetRegistrar};
use crate::streamline::{distance_matrix_mdf, length, resample_bundle, unlist_streamlines, validate_bundle, Streamline};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// streamlines are resampled to this many points before estimating the bundle length
const LENGTH_RESAMPLE_POINTS: usize = 20;
/// clustering threshold, in mm, used for bundle length and disk assignment
const CLUSTER_THRESHOLD: f64 = 85.;
/// bundles with an average length at or below this value (mm) use SHORT_BUNDLE_BETA
const SHORT_BUNDLE_LENGTH: f64 = 50.;
const SHORT_BUNDLE_BETA: f64 = 10.;
/// alpha at or below this value allows pathological deformations
const ALPHA_WARNING: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpParams {
    /// regularization of the deformation. Small values give large deformations
    pub alpha: f64,
    /// width of the motion coherence kernel
    pub beta: f64,
    pub max_iterations: usize,
    /// affine (true) or rigid (false) pre-alignment
    pub affine: bool,
    /// number of segments of the shape profile
    pub no_disks: usize,
}

impl Default for WarpParams {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            beta: 20.,
            max_iterations: 15,
            affine: true,
            no_disks: 10,
        }
    }
}

impl WarpParams {
    pub fn validate(&self) -> Result<()> {
        self.deformation(self.beta).validate()?;
        if self.no_disks == 0 {
            return Err(ReconError::invalid("no_disks must be at least 1"));
        }
        Ok(())
    }

    fn deformation(&self, beta: f64) -> DeformationParams {
        DeformationParams {
            alpha: self.alpha,
            beta,
            max_iterations: self.max_iterations,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundleWarp {
    /// one deformed streamline per moving streamline, in moving order
    pub deformed: Vec<Streamline>,
    /// moving bundle after pre-alignment
    pub moving_aligned: Vec<Streamline>,
    /// mdf distances, rows index moving and columns static streamlines
    pub distances: Array2<f64>,
    pub correspondence: Correspondence,
    /// displacement field of every pair, in moving order
    pub warps: Vec<Array2<f64>>,
    /// kernel width that was actually used
    pub beta: f64,
}

/// average arc length of the cluster centroids of a bundle
pub fn average_bundle_length(bundle: &[Streamline]) -> Result<f64> {
    validate_bundle(bundle, "measured")?;
    let resampled = resample_bundle(bundle, LENGTH_RESAMPLE_POINTS)?;
    let clusters = QuickBundles::new(CLUSTER_THRESHOLD)?.cluster(&resampled)?;
    let total: f64 = clusters.iter().map(|c| length(c.centroid.view())).sum();
    Ok(total / clusters.len() as f64)
}

/// registers the moving bundle onto the static bundle with the default pre-alignment and
/// coherent point drift backends
pub fn bundlewarp(static_bundle: &[Streamline], moving_bundle: &[Streamline], params: &WarpParams) -> Result<BundleWarp> {
    let aligner = CentroidAligner { affine: params.affine, ..Default::default() };
    bundlewarp_with(static_bundle, moving_bundle, params, &aligner, &CoherentPointDrift::default(), None)
}

/// Registers the moving bundle onto the static bundle. When given, `distances` must hold the
/// (moving x static) distances between the aligned moving bundle and the static bundle.
pub fn bundlewarp_with(
    static_bundle: &[Streamline],
    moving_bundle: &[Streamline],
    params: &WarpParams,
    aligner: &dyn BundleAligner,
    registrar: &dyn PointSetRegistrar,
    distances: Option<ArrayView2<f64>>,
) -> Result<BundleWarp> {
    params.validate()?;
    validate_bundle(static_bundle, "static")?;
    validate_bundle(moving_bundle, "moving")?;
    if params.alpha <= ALPHA_WARNING {
        log::warn!("alpha = {} is very small and can lead to pathological deformations", params.alpha);
    }

    let mut beta = params.beta;
    let static_length = average_bundle_length(static_bundle)?;
    if static_length <= SHORT_BUNDLE_LENGTH {
        log::info!("average static bundle length is {static_length:.1} mm, using beta = {SHORT_BUNDLE_BETA}");
        beta = SHORT_BUNDLE_BETA;
    }

    log::info!("pre-aligning {} moving onto {} static streamlines", moving_bundle.len(), static_bundle.len());
    let moving_aligned = aligner.align(static_bundle, moving_bundle)?.aligned;

    let distances = match distances {
        Some(d) => {
            if d.dim() != (moving_bundle.len(), static_bundle.len()) {
                return Err(ReconError::invalid(format!(
                    "expected a ({} x {}) distance matrix, got {:?}", moving_bundle.len(), static_bundle.len(), d.dim()
                )));
            }
            d.to_owned()
        }
        None => distance_matrix_mdf(static_bundle, &moving_aligned)?.reversed_axes(),
    };

    let correspondence = match_streamlines(distances.view())?;
    log::info!("matched streamlines in {} rounds", correspondence.rounds);

    let deformation = params.deformation(beta);
    let warps = correspondence.pairs
        .par_iter()
        .map(|&(m, s)| registrar.register(static_bundle[s].view(), moving_aligned[m].view(), &deformation))
        .collect::<Result<Vec<_>>>()?;

    let (deformed, warps): (Vec<_>, Vec<_>) = warps.into_iter().map(|w| (w.deformed, w.displacement)).unzip();
    Ok(BundleWarp {
        deformed,
        moving_aligned,
        distances,
        correspondence,
        warps,
        beta,
    })
}

/// point-wise displacement between the aligned and the deformed bundle
#[derive(Debug, Clone)]
pub struct VectorField {
    /// offset of each streamline's first point in the flattened arrays
    pub offsets: Vec<usize>,
    /// (P x 3) deformed - aligned
    pub displacement: Array2<f64>,
    pub magnitude: Array1<f64>,
    /// unit displacement direction. Points that did not move get the zero vector.
    pub direction: Array2<f64>,
}

pub fn bundlewarp_vector_field(moving_aligned: &[Streamline], deformed: &[Streamline]) -> Result<VectorField> {
    if moving_aligned.len() != deformed.len() {
        return Err(ReconError::invalid(format!(
            "{} aligned and {} deformed streamlines", moving_aligned.len(), deformed.len()
        )));
    }
    if let Some(i) = moving_aligned.iter().zip(deformed).position(|(a, d)| a.dim() != d.dim()) {
        return Err(ReconError::invalid(format!("aligned and deformed streamline {i} differ in shape")));
    }
    let (aligned_points, offsets) = unlist_streamlines(moving_aligned);
    let (deformed_points, _) = unlist_streamlines(deformed);

    let displacement = deformed_points - aligned_points;
    let magnitude: Array1<f64> = displacement.map_axis(Axis(1), |v| v.dot(&v).sqrt());
    let mut direction = displacement.clone();
    for (mut row, &m) in direction.outer_iter_mut().zip(magnitude.iter()) {
        if m > 0. {
            row /= m;
        } else {
            row.fill(0.);
        }
    }
    Ok(VectorField { offsets, displacement, magnitude, direction })
}

/// mean and standard deviation of the displacement magnitude along the tract
#[derive(Debug, Clone)]
pub struct ShapeProfile {
    /// segment of every point of the deformed bundle
    pub labels: Vec<usize>,
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

/// Labels every point of the target bundle with the position along the tract of its nearest
/// point on the model bundle's cluster centroids resampled to no_disks points.
pub fn assignment_map(target: &[Streamline], model: &[Streamline], no_disks: usize) -> Result<Vec<usize>> {
    validate_bundle(target, "target")?;
    validate_bundle(model, "model")?;
    if no_disks == 0 {
        return Err(ReconError::invalid("no_disks must be at least 1"));
    }
    let (target_points, _) = unlist_streamlines(target);
    if no_disks == 1 {
        return Ok(vec![0; target_points.nrows()]);
    }
    let resampled = resample_bundle(model, no_disks)?;
    let clusters = QuickBundles::new(CLUSTER_THRESHOLD)?.cluster(&resampled)?;
    let centroids: Vec<Streamline> = clusters.into_iter().map(|c| c.centroid).collect();
    let (centroid_points, _) = unlist_streamlines(&centroids);

    let labels = target_points.outer_iter()
        .into_par_iter()
        .map(|p| {
            let mut best = (0, f64::INFINITY);
            for (k, c) in centroid_points.outer_iter().enumerate() {
                let d = (&p - &c).mapv(|x| x * x).sum();
                if d < best.1 {
                    best = (k, d);
                }
            }
            best.0 % no_disks
        })
        .collect();
    Ok(labels)
}

pub fn bundlewarp_shape_analysis(moving_aligned: &[Streamline], deformed: &[Streamline], no_disks: usize) -> Result<ShapeProfile> {
    let labels = assignment_map(deformed, deformed, no_disks)?;
    let field = bundlewarp_vector_field(moving_aligned, deformed)?;

    let mut mean = Array1::zeros(no_disks);
    let mut std = Array1::zeros(no_disks);
    for disk in 0..no_disks {
        let values: Vec<f64> = labels.iter()
            .zip(field.magnitude.iter())
            .filter(|(&l, _)| l == disk)
            .map(|(_, &m)| m)
            .collect();
        if values.is_empty() {
            log::warn!("shape profile segment {disk} has no points");
            continue;
        }
        let n = values.len() as f64;
        let mu = values.iter().sum::<f64>() / n;
        mean[disk] = mu;
        std[disk] = (values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / n).sqrt();
    }
    Ok(ShapeProfile { labels, mean, std })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::tests::arc;
    use crate::streamline::tests::line;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn arcs(n: usize, len: f64) -> Vec<Streamline> {
        (0..n).map(|i| arc(20, len, i as f64 * 2.)).collect()
    }

    #[test]
    fn params_defaults_and_validation() {
        let p = WarpParams::default();
        assert!(p.validate().is_ok());
        assert_eq!(p.no_disks, 10);
        assert!(WarpParams { alpha: 0., ..p }.validate().is_err());
        assert!(WarpParams { beta: -1., ..p }.validate().is_err());
        assert!(WarpParams { no_disks: 0, ..p }.validate().is_err());
        assert!(WarpParams { max_iterations: 0, ..p }.validate().is_err());
    }

    #[test]
    fn average_length_of_parallel_lines() {
        let bundle = vec![line(0., 0., 100., 30), line(1., 0., 100., 50), line(0., 1., 100., 12)];
        assert_abs_diff_eq!(average_bundle_length(&bundle).unwrap(), 100., epsilon = 1e-9);
        // two distant groups give two centroids
        let bundle = vec![line(0., 0., 100., 20), line(500., 0., 40., 20)];
        assert_abs_diff_eq!(average_bundle_length(&bundle).unwrap(), 70., epsilon = 1e-9);
    }

    #[test]
    fn coincident_bundles_do_not_move() {
        let bundle = arcs(4, 90.);
        let warp = bundlewarp(&bundle, &bundle, &WarpParams::default()).unwrap();
        assert_eq!(warp.beta, 20.);
        assert_eq!(warp.deformed.len(), 4);
        assert_eq!(warp.correspondence.pairs, vec![(0, 0), (1, 1), (2, 2), (3, 3)]);
        for (d, s) in warp.deformed.iter().zip(&bundle) {
            for (a, b) in d.iter().zip(s.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-6);
            }
        }
        let field = bundlewarp_vector_field(&warp.moving_aligned, &warp.deformed).unwrap();
        assert_eq!(field.magnitude.len(), 80);
        assert!(field.magnitude.iter().all(|&m| m < 1e-6));
        assert!(field.direction.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn short_bundles_use_a_narrow_kernel() {
        let bundle: Vec<Streamline> = (0..3).map(|i| line(i as f64, 0., 40., 15)).collect();
        let warp = bundlewarp(&bundle, &bundle, &WarpParams { affine: false, ..Default::default() }).unwrap();
        assert_eq!(warp.beta, 10.);
    }

    #[test]
    fn more_moving_than_static_streamlines() {
        let statics = arcs(3, 90.);
        let moving = arcs(5, 90.);
        let warp = bundlewarp(&statics, &moving, &WarpParams::default()).unwrap();
        assert_eq!(warp.deformed.len(), 5);
        assert_eq!(warp.warps.len(), 5);
        assert_eq!(warp.distances.dim(), (5, 3));
        let moving_idx: Vec<_> = warp.correspondence.pairs.iter().map(|p| p.0).collect();
        assert_eq!(moving_idx, vec![0, 1, 2, 3, 4]);
        assert!(warp.correspondence.rounds >= 2);
        assert!(warp.deformed.iter().zip(&moving).all(|(d, m)| d.dim() == m.dim()));
    }

    #[test]
    fn precomputed_distances_must_match() {
        let bundle = arcs(2, 90.);
        let bad = Array2::zeros((3, 2));
        let r = bundlewarp_with(
            &bundle, &bundle, &WarpParams::default(),
            &CentroidAligner::default(), &CoherentPointDrift::default(), Some(bad.view()),
        );
        assert!(matches!(r, Err(ReconError::InvalidParameter(_))));
    }

    #[test]
    fn zero_displacement_direction_is_zero() {
        let a = vec![array![[0., 0., 0.], [1., 0., 0.]]];
        let d = vec![array![[0., 0., 0.], [1., 3., 4.]]];
        let field = bundlewarp_vector_field(&a, &d).unwrap();
        assert_eq!(field.offsets, vec![0]);
        assert_eq!(field.magnitude[0], 0.);
        assert_eq!(field.direction.row(0).to_vec(), vec![0., 0., 0.]);
        assert_abs_diff_eq!(field.magnitude[1], 5., epsilon = 1e-12);
        assert_abs_diff_eq!(field.direction[[1, 2]], 0.8, epsilon = 1e-12);
        assert!(bundlewarp_vector_field(&a, &[]).is_err());
    }

    #[test]
    fn assignment_follows_tract_position() {
        let bundle = vec![line(0., 0., 90., 10), line(1., 0., 90., 10)];
        let labels = assignment_map(&bundle, &bundle, 10).unwrap();
        assert_eq!(labels.len(), 20);
        assert_eq!(&labels[..10], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(assignment_map(&bundle, &bundle, 1).unwrap(), vec![0; 20]);
    }

    #[test]
    fn zero_displacement_profile() {
        let bundle = arcs(3, 90.);
        let profile = bundlewarp_shape_analysis(&bundle, &bundle, 10).unwrap();
        assert_eq!(profile.mean.len(), 10);
        assert!(profile.mean.iter().all(|&m| m.abs() < 1e-12));
        assert!(profile.std.iter().all(|&s| s.abs() < 1e-12));
    }

    #[test]
    fn profile_reports_shift() {
        let aligned = arcs(3, 90.);
        let deformed: Vec<Streamline> = aligned.iter().map(|s| s + &array![0., 0., 2.]).collect();
        let profile = bundlewarp_shape_analysis(&aligned, &deformed, 5).unwrap();
        for disk in 0..5 {
            assert_abs_diff_eq!(profile.mean[disk], 2., epsilon = 1e-12);
            assert_abs_diff_eq!(profile.std[disk], 0., epsilon = 1e-12);
        }
    }
}
