// SHORE basis matrices. Every builder walks the single basis enumeration from shore_index and only
// differs in the per-column formula. Rows are samples, columns are basis functions.

use crate::error::{ReconError, Result};
use crate::gradients::GradientTable;
use crate::shore_index::{basis_indices, BasisIndex};
use crate::special::{cart2sphere, fact, gamma, genlaguerre, hyp2f1_terminating, real_sph_harm};
use ndarray::{Array2, ArrayView2, ShapeBuilder};
use rayon::prelude::*;
use std::f64::consts::PI;

/// spherical coordinates (r, polar, azimuth) of one sample
#[derive(Debug, Clone, Copy)]
struct SphericalSample {
    r: f64,
    theta: f64,
    phi: f64,
}

fn to_spherical(points: ArrayView2<f64>) -> Result<Vec<SphericalSample>> {
    if points.ncols() != 3 {
        return Err(ReconError::invalid(format!("expected an (N x 3) point table, got {:?}", points.dim())));
    }
    Ok(points.rows().into_iter().map(|p| {
        let (r, theta, phi) = cart2sphere(p[0], p[1], p[2]);
        SphericalSample { r, theta, phi }
    }).collect())
}

fn validate_zeta(zeta: f64) -> Result<()> {
    if !(zeta > 0.) || !zeta.is_finite() {
        return Err(ReconError::invalid(format!("zeta must be a positive scale, got {zeta}")));
    }
    Ok(())
}

/// evaluates one column per basis index in parallel and assembles a col-major (samples x basis) matrix
fn build_columns<F>(samples: &[SphericalSample], basis: &[BasisIndex], column: F) -> Result<Array2<f64>>
where
    F: Fn(&BasisIndex, &SphericalSample) -> f64 + Sync,
{
    let column = &column;
    let data: Vec<f64> = basis.par_iter()
        .flat_map_iter(|b| samples.iter().map(move |s| column(b, s)))
        .collect();
    Array2::from_shape_vec((samples.len(), basis.len()).f(), data)
        .map_err(|e| ReconError::invalid(format!("failed to assemble basis matrix: {e}")))
}

fn kappa(zeta: f64, n: u32, l: u32) -> f64 {
    (2. * fact(n - l) / (zeta.powf(1.5) * gamma(n as f64 + 1.5))).sqrt()
}

fn kappa_pdf(zeta: f64, n: u32, l: u32) -> f64 {
    (16. * PI.powi(3) * zeta.powf(1.5) * fact(n - l) / gamma(n as f64 + 1.5)).sqrt()
}

fn kappa_odf(zeta: f64, n: u32, l: u32) -> f64 {
    let l = l as f64;
    let num = gamma(l / 2. + 1.5).powi(2) * gamma(n as f64 + 1.5) * 2f64.powf(l + 3.);
    let den = 16. * PI.powi(3) * zeta.powf(1.5) * fact(n - l as u32) * gamma(l + 1.5).powi(2);
    (num / den).sqrt()
}

/// q-space sample positions q * g with q = sqrt(b / (4 pi^2 tau))
pub fn q_space_points(gtab: &GradientTable, tau: f64) -> Array2<f64> {
    let mut q = Array2::zeros((gtab.len(), 3));
    for (i, (&b, g)) in gtab.bvals().iter().zip(gtab.bvecs()).enumerate() {
        let qval = (b / (4. * PI * PI * tau)).sqrt();
        for k in 0..3 {
            q[[i, k]] = qval * g[k];
        }
    }
    q
}

/// signal basis matrix for the modified 3D-SHORE evaluated at the q-space samples of a gradient table
pub fn shore_matrix(radial_order: u32, zeta: f64, gtab: &GradientTable, tau: f64) -> Result<Array2<f64>> {
    validate_zeta(zeta)?;
    if !(tau > 0.) {
        return Err(ReconError::invalid(format!("diffusion time must be positive, got {tau}")));
    }
    let basis = basis_indices(radial_order)?;
    let samples = to_spherical(q_space_points(gtab, tau).view())?;
    build_columns(&samples, &basis, |b, s| {
        let x = s.r * s.r / zeta;
        real_sph_harm(b.m, b.l, s.theta, s.phi)
            * genlaguerre(b.radial_degree(), b.l as f64 + 0.5, x)
            * (-x / 2.).exp()
            * kappa(zeta, b.n, b.l)
            * x.powi((b.l / 2) as i32)
    })
}

/// propagator basis matrix evaluated at real-space points (N x 3)
pub fn shore_matrix_pdf(radial_order: u32, zeta: f64, rtab: ArrayView2<f64>) -> Result<Array2<f64>> {
    validate_zeta(zeta)?;
    let basis = basis_indices(radial_order)?;
    let samples = to_spherical(rtab)?;
    build_columns(&samples, &basis, |b, s| {
        let x = 4. * PI * PI * zeta * s.r * s.r;
        real_sph_harm(b.m, b.l, s.theta, s.phi)
            * genlaguerre(b.radial_degree(), b.l as f64 + 0.5, x)
            * (-x / 2.).exp()
            * kappa_pdf(zeta, b.n, b.l)
            * x.powi((b.l / 2) as i32)
            * b.sign()
    })
}

/// orientation distribution basis matrix evaluated at sphere vertices (N x 3)
pub fn shore_matrix_odf(radial_order: u32, zeta: f64, vertices: ArrayView2<f64>) -> Result<Array2<f64>> {
    validate_zeta(zeta)?;
    let basis = basis_indices(radial_order)?;
    let samples = to_spherical(vertices)?;
    build_columns(&samples, &basis, |b, s| {
        let l = b.l as f64;
        b.sign()
            * kappa_odf(zeta, b.n, b.l)
            * hyp2f1_terminating(b.radial_degree(), l / 2. + 1.5, l + 1.5, 2.)
            * real_sph_harm(b.m, b.l, s.theta, s.phi)
    })
}

fn diagonal(radial_order: u32, entry: impl Fn(&BasisIndex) -> f64) -> Result<Array2<f64>> {
    let basis = basis_indices(radial_order)?;
    let mut d = Array2::zeros((basis.len(), basis.len()));
    for (i, b) in basis.iter().enumerate() {
        d[[i, i]] = entry(b);
    }
    Ok(d)
}

/// angular regularization matrix, diag((l(l+1))^2)
pub fn l_shore(radial_order: u32) -> Result<Array2<f64>> {
    diagonal(radial_order, |b| ((b.l * (b.l + 1)) as f64).powi(2))
}

/// radial regularization matrix, diag((n(n+1))^2)
pub fn n_shore(radial_order: u32) -> Result<Array2<f64>> {
    diagonal(radial_order, |b| ((b.n * (b.n + 1)) as f64).powi(2))
}

/// symmetric real-space grid on which the propagator is evaluated. Returns the integer grid
/// coordinates of each sample and the (N x 3) table of real-space positions spanning
/// [-radius_max, radius_max] on every axis.
pub fn create_rspace(gridsize: usize, radius_max: f64) -> Result<(Vec<[usize; 3]>, Array2<f64>)> {
    if gridsize < 3 || gridsize % 2 == 0 {
        return Err(ReconError::invalid(format!("grid size must be odd and at least 3, got {gridsize}")));
    }
    if !(radius_max > 0.) || !radius_max.is_finite() {
        return Err(ReconError::invalid(format!("radius_max must be positive, got {radius_max}")));
    }
    let radius = (gridsize / 2) as i64;
    let n = gridsize.pow(3);
    let mut vecs = Vec::with_capacity(n);
    let mut tab = Array2::zeros((n, 3));
    let mut row = 0;
    for i in -radius..=radius {
        for j in -radius..=radius {
            for k in -radius..=radius {
                vecs.push([(i + radius) as usize, (j + radius) as usize, (k + radius) as usize]);
                tab[[row, 0]] = i as f64 / radius as f64 * radius_max;
                tab[[row, 1]] = j as f64 / radius as f64 * radius_max;
                tab[[row, 2]] = k as f64 / radius as f64 * radius_max;
                row += 1;
            }
        }
    }
    Ok((vecs, tab))
}
