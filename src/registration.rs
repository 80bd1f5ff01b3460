// Nonrigid point-set registration. Bundle warping only needs something that deforms one point set
// onto another, so backends sit behind the PointSetRegistrar trait.

use crate::error::{ReconError, Result};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// parameters of a deformable registration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeformationParams {
    /// trade-off between fitting the target and smoothness of the deformation
    pub alpha: f64,
    /// width of the gaussian kernel coupling the motion of neighbouring points
    pub beta: f64,
    pub max_iterations: usize,
}

impl DeformationParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.) || !self.alpha.is_finite() {
            return Err(ReconError::invalid(format!("alpha must be positive, got {}", self.alpha)));
        }
        if !(self.beta > 0.) || !self.beta.is_finite() {
            return Err(ReconError::invalid(format!("beta must be positive, got {}", self.beta)));
        }
        if self.max_iterations == 0 {
            return Err(ReconError::invalid("max_iterations must be at least 1"));
        }
        Ok(())
    }
}

/// result of deforming a source point set onto a target
#[derive(Debug, Clone)]
pub struct PointSetWarp {
    /// deformed source points, same shape and order as the source
    pub deformed: Array2<f64>,
    /// per-point displacement, deformed - source
    pub displacement: Array2<f64>,
    pub iterations: usize,
    /// final variance of the gaussian mixture
    pub sigma2: f64,
}

pub trait PointSetRegistrar: Sync {
    /// deforms the (M x 3) source points onto the (N x 3) target points
    fn register(&self, target: ArrayView2<f64>, source: ArrayView2<f64>, params: &DeformationParams) -> Result<PointSetWarp>;
}

/// Coherent point drift: the source points are centroids of a gaussian mixture fitted to the
/// target by expectation maximization, with a motion field regularized through a gaussian kernel.
#[derive(Debug, Clone, Copy)]
pub struct CoherentPointDrift {
    /// convergence threshold on the change of the mixture variance
    pub tolerance: f64,
    /// weight of the uniform outlier component, in [0, 1)
    pub w: f64,
}

impl Default for CoherentPointDrift {
    fn default() -> Self {
        Self {
            tolerance: 0.001,
            w: 0.,
        }
    }
}

fn to_dmatrix(points: ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(points.nrows(), points.ncols(), |i, j| points[[i, j]])
}

fn to_array(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

fn validate_points(points: ArrayView2<f64>, name: &str) -> Result<()> {
    if points.nrows() == 0 || points.ncols() != 3 {
        return Err(ReconError::invalid(format!("{name} must be a non-empty (N x 3) point set, got {:?}", points.dim())));
    }
    if points.iter().any(|x| !x.is_finite()) {
        return Err(ReconError::invalid(format!("{name} has non-finite points")));
    }
    Ok(())
}

fn sq_dist(a: &DMatrix<f64>, i: usize, b: &DMatrix<f64>, j: usize) -> f64 {
    (0..a.ncols()).map(|d| (a[(i, d)] - b[(j, d)]).powi(2)).sum()
}

impl PointSetRegistrar for CoherentPointDrift {
    fn register(&self, target: ArrayView2<f64>, source: ArrayView2<f64>, params: &DeformationParams) -> Result<PointSetWarp> {
        params.validate()?;
        validate_points(target, "target")?;
        validate_points(source, "source")?;
        if !(0. ..1.).contains(&self.w) {
            return Err(ReconError::invalid(format!("outlier weight must be in [0, 1), got {}", self.w)));
        }

        let x = to_dmatrix(target);
        let y = to_dmatrix(source);
        let (n, d) = (x.nrows(), x.ncols());
        let m = y.nrows();
        let eps = f64::EPSILON;

        let mut sigma2 = (0..n)
            .flat_map(|i| (0..m).map(move |j| (i, j)))
            .map(|(i, j)| sq_dist(&x, i, &y, j))
            .sum::<f64>() / (d * m * n) as f64;
        if sigma2 <= 0. {
            sigma2 = self.tolerance / 10.;
        }

        let g = DMatrix::from_fn(m, m, |i, j| (-sq_dist(&y, i, &y, j) / (2. * params.beta * params.beta)).exp());
        let mut w = DMatrix::<f64>::zeros(m, d);
        let mut ty = y.clone();
        let mut iterations = 0;
        let mut diff = f64::INFINITY;

        while iterations < params.max_iterations && diff > self.tolerance {
            // expectation
            let mut p = DMatrix::from_fn(m, n, |j, i| (-sq_dist(&x, i, &ty, j) / (2. * sigma2)).exp());
            let c = (2. * PI * sigma2).powf(d as f64 / 2.) * self.w / (1. - self.w) * m as f64 / n as f64;
            for mut col in p.column_iter_mut() {
                let mut den = col.sum() + c;
                if den == 0. {
                    den = eps;
                }
                col /= den;
            }
            let pt1: DVector<f64> = p.row_sum().transpose();
            let p1: DVector<f64> = p.column_sum();
            let np = p1.sum();
            if np < eps {
                log::warn!("point-set registration lost all correspondences after {iterations} iterations");
                break;
            }
            let px = &p * &x;

            // maximization
            let a = DMatrix::from_diagonal(&p1) * &g + DMatrix::identity(m, m) * (params.alpha * sigma2);
            let b = &px - DMatrix::from_diagonal(&p1) * &y;
            w = a.lu().solve(&b)
                .ok_or_else(|| ReconError::SingularMatrix("coherent point drift system is singular".to_string()))?;
            ty = &y + &g * &w;

            let previous = sigma2;
            let x_px: f64 = (0..n).map(|i| pt1[i] * x.row(i).norm_squared()).sum();
            let y_py: f64 = (0..m).map(|j| p1[j] * ty.row(j).norm_squared()).sum();
            let tr_pxy = ty.component_mul(&px).sum();
            sigma2 = (x_px - 2. * tr_pxy + y_py) / (np * d as f64);
            if sigma2 <= 0. {
                sigma2 = self.tolerance / 10.;
            }
            diff = (sigma2 - previous).abs();
            iterations += 1;
        }
        log::debug!("coherent point drift: {iterations} iterations, sigma2 {sigma2:.3e}");

        let displacement = &g * &w;
        Ok(PointSetWarp {
            deformed: to_array(&ty),
            displacement: to_array(&displacement),
            iterations,
            sigma2,
        })
    }
}
