// SHORE model fitting and the quantities derived from fitted coefficients: propagator, ODF,
// return-to-origin probability and mean squared displacement

use crate::error::{ReconError, Result};
use crate::gradients::{GradientTable, Sphere};
use crate::matrix_cache::{fingerprint, GeometryKey, MatrixCache, MatrixKind};
use crate::shore_index::{basis_indices, validate_radial_order, BasisIndex};
use crate::shore_matrix::{create_rspace, l_shore, n_shore, shore_matrix, shore_matrix_odf, shore_matrix_pdf};
use crate::special::{fact, gamma, genlaguerre, hyp2f1_terminating, sph_harm_count, sph_harm_index};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

/// smallest accepted ratio between the extreme singular values of the regularized gram matrix
const GRAM_RCOND: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoreParams {
    /// even truncation order of the basis
    pub radial_order: u32,
    /// scale of the basis functions
    pub zeta: f64,
    /// radial regularization weight
    pub lambda_n: f64,
    /// angular regularization weight
    pub lambda_l: f64,
}

impl Default for ShoreParams {
    fn default() -> Self {
        Self {
            radial_order: 6,
            zeta: 700.,
            lambda_n: 1e-8,
            lambda_l: 1e-8,
        }
    }
}

impl ShoreParams {
    pub fn validate(&self) -> Result<()> {
        validate_radial_order(self.radial_order)?;
        if !(self.zeta > 0.) || !self.zeta.is_finite() {
            return Err(ReconError::invalid(format!("zeta must be a positive scale, got {}", self.zeta)));
        }
        for (name, v) in [("lambda_n", self.lambda_n), ("lambda_l", self.lambda_l)] {
            if !(v >= 0.) || !v.is_finite() {
                return Err(ReconError::invalid(format!("{name} must be finite and non-negative, got {v}")));
            }
        }
        Ok(())
    }
}

/// A SHORE model bound to one gradient table. Design matrices are evaluated lazily and kept in a
/// cache owned by the model, so fits sharing a model never rebuild the same matrix.
#[derive(Debug)]
pub struct ShoreModel {
    gtab: GradientTable,
    params: ShoreParams,
    tau: f64,
    basis: Vec<BasisIndex>,
    cache: MatrixCache,
}

impl ShoreModel {
    pub fn new(gtab: GradientTable, params: ShoreParams) -> Result<Self> {
        params.validate()?;
        let basis = basis_indices(params.radial_order)?;
        let tau = gtab.diffusion_time();
        log::debug!(
            "shore model: radial order {}, {} coefficients, zeta {}, tau {:.6}",
            params.radial_order, basis.len(), params.zeta, tau
        );
        Ok(Self {
            gtab,
            params,
            tau,
            basis,
            cache: MatrixCache::new(),
        })
    }

    pub fn gtab(&self) -> &GradientTable {
        &self.gtab
    }

    pub fn params(&self) -> &ShoreParams {
        &self.params
    }

    pub fn basis(&self) -> &[BasisIndex] {
        &self.basis
    }

    /// diffusion time used to scale q-space radii
    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// number of matrices currently held by the model cache
    pub fn cached_matrices(&self) -> usize {
        self.cache.len()
    }

    fn gradients_key(&self) -> GeometryKey {
        GeometryKey::Gradients(self.gtab.fingerprint())
    }

    /// signal basis matrix on the model's gradient table
    pub fn signal_matrix(&self) -> Result<Arc<Array2<f64>>> {
        let p = &self.params;
        self.cache.get_or_try_insert_with(MatrixKind::Signal, self.gradients_key(), || {
            shore_matrix(p.radial_order, p.zeta, &self.gtab, self.tau)
        })
    }

    fn pseudo_inverse(&self) -> Result<Arc<Array2<f64>>> {
        let m = self.signal_matrix()?;
        let p = &self.params;
        self.cache.get_or_try_insert_with(MatrixKind::SignalPseudoInverse, self.gradients_key(), || {
            let gram = m.t().dot(&*m)
                + n_shore(p.radial_order)? * p.lambda_n
                + l_shore(p.radial_order)? * p.lambda_l;
            let k = gram.nrows();
            let gram = DMatrix::from_fn(k, k, |i, j| gram[[i, j]]);
            let singular_values = gram.singular_values();
            let (s_max, s_min) = (singular_values.max(), singular_values.min());
            log::debug!("regularized gram matrix singular values in [{s_min:e}, {s_max:e}]");
            if !(s_min > s_max * GRAM_RCOND) {
                return Err(ReconError::SingularMatrix(format!(
                    "regularized gram matrix is rank deficient (condition {:e})", s_max / s_min
                )));
            }
            let inv = gram
                .try_inverse()
                .ok_or_else(|| ReconError::SingularMatrix("regularized gram matrix is not invertible".to_string()))?;
            if inv.iter().any(|x| !x.is_finite()) {
                return Err(ReconError::SingularMatrix("regularized gram matrix inverse is not finite".to_string()));
            }
            let inv = Array2::from_shape_fn((k, k), |(i, j)| inv[(i, j)]);
            Ok(inv.dot(&m.t()))
        })
    }

    /// fits the coefficients for one voxel. The signal must be ordered like the gradient table.
    pub fn fit(&self, signal: ArrayView1<f64>) -> Result<ShoreFit<'_>> {
        let pinv = self.pseudo_inverse()?;
        self.fit_with(&pinv, signal)
    }

    /// fits every row of a (voxels x gradients) signal array in parallel
    pub fn fit_multi(&self, signals: ArrayView2<f64>) -> Result<Vec<ShoreFit<'_>>> {
        if signals.ncols() != self.gtab.len() {
            return Err(ReconError::invalid(format!(
                "expected {} samples per voxel, got {}", self.gtab.len(), signals.ncols()
            )));
        }
        let pinv = self.pseudo_inverse()?;
        let fits = signals.axis_iter(Axis(0))
            .into_par_iter()
            .map(|s| self.fit_with(&pinv, s))
            .collect::<Result<Vec<_>>>()?;
        log::debug!("fitted {} voxels", fits.len());
        Ok(fits)
    }

    fn fit_with(&self, pinv: &Array2<f64>, signal: ArrayView1<f64>) -> Result<ShoreFit<'_>> {
        if signal.len() != self.gtab.len() {
            return Err(ReconError::invalid(format!(
                "expected {} samples, got {}", self.gtab.len(), signal.len()
            )));
        }
        if signal.iter().any(|s| !s.is_finite()) {
            return Err(ReconError::invalid("signal contains non-finite samples"));
        }
        let coef = pinv.dot(&signal);
        let signal_0 = signal_at_origin(&coef, self.params.radial_order, self.params.zeta);
        if signal_0 == 0. || !signal_0.is_finite() {
            return Err(ReconError::degenerate(format!("reconstructed signal at q=0 is {signal_0}")));
        }
        Ok(ShoreFit {
            model: self,
            coef: coef / signal_0,
        })
    }
}

/// the signal reconstructed at q = 0. Only the isotropic l = 0 terms contribute and they lead the
/// basis enumeration, so coefficient n is found at position n.
fn signal_at_origin(coef: &Array1<f64>, radial_order: u32, zeta: f64) -> f64 {
    (0..=radial_order / 2).map(|n| {
        let nf = n as f64;
        coef[n as usize]
            * genlaguerre(n, 0.5, 0.)
            * (fact(n) / (2. * PI * zeta.powf(1.5) * gamma(nf + 1.5))).sqrt()
    }).sum()
}

#[inline]
fn alternating(n: u32) -> f64 {
    if n % 2 == 0 { 1. } else { -1. }
}

#[derive(Debug, Clone)]
pub struct ShoreFit<'a> {
    model: &'a ShoreModel,
    coef: Array1<f64>,
}

impl<'a> ShoreFit<'a> {
    pub fn model(&self) -> &'a ShoreModel {
        self.model
    }

    /// basis-ordered coefficients, normalized so the signal at q = 0 is 1
    pub fn shore_coeff(&self) -> &Array1<f64> {
        &self.coef
    }

    /// the signal reconstructed at the model's gradient table
    pub fn fitted_signal(&self) -> Result<Array1<f64>> {
        Ok(self.model.signal_matrix()?.dot(&self.coef))
    }

    pub fn signal_at_origin(&self) -> f64 {
        let p = &self.model.params;
        signal_at_origin(&self.coef, p.radial_order, p.zeta)
    }

    /// the propagator on a symmetric cubic grid of gridsize^3 points spanning
    /// [-radius_max, radius_max], scaled by the cell volume and clipped to be non-negative
    pub fn pdf_grid(&self, gridsize: usize, radius_max: f64) -> Result<Array3<f64>> {
        let (vecs, rtab) = create_rspace(gridsize, radius_max)?;
        let p = &self.model.params;
        let key = GeometryKey::Grid { size: gridsize, radius_bits: radius_max.to_bits() };
        let psi = self.model.cache.get_or_try_insert_with(MatrixKind::Propagator, key, || {
            shore_matrix_pdf(p.radial_order, p.zeta, rtab.view())
        })?;
        let values = psi.dot(&self.coef);
        let cell_volume = (2. * radius_max / (gridsize - 1) as f64).powi(3);
        let mut grid = Array3::zeros((gridsize, gridsize, gridsize));
        for (v, x) in vecs.iter().zip(values.iter()) {
            grid[*v] = (x * cell_volume).max(0.);
        }
        Ok(grid)
    }

    /// the propagator evaluated at arbitrary (N x 3) real-space points, clipped to be non-negative
    pub fn pdf(&self, rtab: ArrayView2<f64>) -> Result<Array1<f64>> {
        let p = &self.model.params;
        let key = GeometryKey::Points(fingerprint(rtab.iter().copied()));
        let psi = self.model.cache.get_or_try_insert_with(MatrixKind::Propagator, key, || {
            shore_matrix_pdf(p.radial_order, p.zeta, rtab)
        })?;
        Ok(psi.dot(&self.coef).mapv(|x| x.max(0.)))
    }

    /// real spherical harmonic coefficients of the ODF, sh order equal to the radial order
    pub fn odf_sh(&self) -> Array1<f64> {
        let p = &self.model.params;
        let mut c_sh = Array1::zeros(sph_harm_count(p.radial_order));
        let scale = (4. * PI * PI * p.zeta).powf(1.5);
        for (b, c) in self.model.basis.iter().zip(self.coef.iter()) {
            let (n, l) = (b.n as f64, b.l as f64);
            let cnl = b.sign() / (2. * scale) * (2. * scale * fact(b.radial_degree()) / gamma(n + 1.5)).sqrt();
            let gnl = gamma(l / 2. + 1.5) * gamma(1.5 + n) / (gamma(l + 1.5) * fact(b.radial_degree()))
                * 0.5f64.powf(-l / 2. - 1.5);
            let fnl = hyp2f1_terminating(b.radial_degree(), l / 2. + 1.5, l + 1.5, 2.);
            c_sh[sph_harm_index(b.l, b.m)] += c * cnl * gnl * fnl;
        }
        c_sh
    }

    /// the ODF on the vertices of a sphere. Values are not clipped.
    pub fn odf(&self, sphere: &Sphere) -> Result<Array1<f64>> {
        let p = &self.model.params;
        let key = GeometryKey::Sphere(sphere.fingerprint());
        let upsilon = self.model.cache.get_or_try_insert_with(MatrixKind::Odf, key, || {
            shore_matrix_odf(p.radial_order, p.zeta, sphere.vertices().view())
        })?;
        Ok(upsilon.dot(&self.coef))
    }

    /// return-to-origin probability computed from the signal coefficients
    pub fn rtop_signal(&self) -> f64 {
        let zeta = self.model.params.zeta;
        self.radial_sum(|n| {
            (16. * PI * zeta.powf(1.5) * gamma(n as f64 + 1.5) / fact(n)).sqrt()
        })
    }

    /// return-to-origin probability computed from the propagator coefficients
    pub fn rtop_pdf(&self) -> f64 {
        let zeta = self.model.params.zeta;
        self.radial_sum(|n| {
            (4. * PI * PI * zeta.powf(1.5) * fact(n) / gamma(n as f64 + 1.5)).sqrt() * genlaguerre(n, 0.5, 0.)
        })
    }

    /// mean squared displacement
    pub fn msd(&self) -> f64 {
        let zeta = self.model.params.zeta;
        self.radial_sum(|n| {
            (9. * gamma(n as f64 + 1.5) / (8. * PI.powi(6) * zeta.powf(3.5) * fact(n))).sqrt()
                * hyp2f1_terminating(n, 2.5, 1.5, 2.)
        })
    }

    /// sum over the isotropic coefficients with alternating sign, floored at zero
    fn radial_sum(&self, term: impl Fn(u32) -> f64) -> f64 {
        let total: f64 = (0..=self.model.params.radial_order / 2)
            .map(|n| self.coef[n as usize] * alternating(n) * term(n))
            .sum();
        total.max(0.)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sims::sticks_and_ball;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::{array, Array2};

    fn gtab() -> GradientTable {
        GradientTable::multi_shell(&[1000., 2000.], 60, 1).unwrap()
    }

    /// two crossing sticks along z and x in an isotropic ball
    fn crossing_signal(g: &GradientTable) -> Array1<f64> {
        sticks_and_ball(g, 0.0015, 1., &[(0., 0.), (90., 0.)], &[0.35, 0.35], None, &mut rand::rng()).unwrap()
    }

    fn model(lambda: f64) -> ShoreModel {
        let params = ShoreParams { lambda_n: lambda, lambda_l: lambda, ..ShoreParams::default() };
        ShoreModel::new(gtab(), params).unwrap()
    }

    fn residual(fit: &ShoreFit, signal: &Array1<f64>) -> f64 {
        (fit.fitted_signal().unwrap() - signal).mapv(|x| x * x).sum().sqrt()
    }

    #[test]
    fn params_validation() {
        assert!(ShoreParams::default().validate().is_ok());
        assert!(ShoreParams { radial_order: 5, ..Default::default() }.validate().is_err());
        assert!(ShoreParams { zeta: 0., ..Default::default() }.validate().is_err());
        assert!(ShoreParams { lambda_l: -1., ..Default::default() }.validate().is_err());
        assert!(ShoreModel::new(gtab(), ShoreParams { radial_order: 0, ..Default::default() }).is_err());
    }

    #[test]
    fn fit_reproduces_signal() {
        let m = model(1e-8);
        let signal = crossing_signal(m.gtab());
        let fit = m.fit(signal.view()).unwrap();
        assert_eq!(fit.shore_coeff().len(), 50);
        assert_abs_diff_eq!(fit.signal_at_origin(), 1., epsilon = 1e-10);
        let fitted = fit.fitted_signal().unwrap();
        assert_abs_diff_eq!(fitted[0], 1., epsilon = 1e-3);
        assert!(residual(&fit, &signal) / signal.sum() < 5e-3);
    }

    #[test]
    fn residual_grows_with_regularization() {
        let g = gtab();
        let signal = crossing_signal(&g);
        let residuals: Vec<f64> = [1e-8, 1e-2, 1.].iter().map(|&lambda| {
            let m = model(lambda);
            residual(&m.fit(signal.view()).unwrap(), &signal)
        }).collect();
        assert!(residuals[0] < residuals[1]);
        assert!(residuals[1] <= residuals[2]);
    }

    #[test]
    fn scalar_maps_agree() {
        let m = model(1e-8);
        let fit = m.fit(crossing_signal(m.gtab()).view()).unwrap();
        let rtop_signal = fit.rtop_signal();
        let rtop_pdf = fit.rtop_pdf();
        assert!(rtop_signal > 0.);
        assert_relative_eq!(rtop_signal, rtop_pdf, max_relative = 1e-8);
        let at_origin = fit.pdf(Array2::zeros((1, 3)).view()).unwrap();
        assert_relative_eq!(at_origin[0], rtop_pdf, max_relative = 1e-8);
        assert!(fit.msd() > 0.);
    }

    #[test]
    fn odf_peaks_follow_sticks() {
        let m = model(1e-8);
        let fit = m.fit(crossing_signal(m.gtab()).view()).unwrap();
        let sphere = Sphere::new(&[[0., 0., 1.], [1., 0., 0.], [0., 1., 0.]]).unwrap();
        let odf = fit.odf(&sphere).unwrap();
        assert!(odf[0] > odf[2]);
        assert!(odf[1] > odf[2]);

        // the sh projection evaluated with the real harmonics reproduces the sampled odf
        let sh = fit.odf_sh();
        assert_eq!(sh.len(), 28);
        let dense = Sphere::fibonacci(50).unwrap();
        let odf = fit.odf(&dense).unwrap();
        for (i, v) in dense.vertices().rows().into_iter().enumerate() {
            let (_, theta, phi) = crate::special::cart2sphere(v[0], v[1], v[2]);
            let mut value = 0.;
            for l in (0..=6u32).step_by(2) {
                for mm in -(l as i32)..=l as i32 {
                    value += sh[sph_harm_index(l, mm)] * crate::special::real_sph_harm(mm, l, theta, phi);
                }
            }
            assert_relative_eq!(value, odf[i], max_relative = 1e-6, epsilon = 1e-9);
        }
    }

    #[test]
    fn propagator_is_non_negative() {
        let m = model(1e-8);
        let fit = m.fit(crossing_signal(m.gtab()).view()).unwrap();
        let grid = fit.pdf_grid(11, 20e-3).unwrap();
        assert_eq!(grid.dim(), (11, 11, 11));
        assert!(grid.iter().all(|&x| x >= 0.));
        // the centre of the grid is the origin, scaled by the cell volume
        let cell_volume = (2. * 20e-3 / 10f64).powi(3);
        assert_relative_eq!(grid[[5, 5, 5]], fit.rtop_pdf() * cell_volume, max_relative = 1e-8);

        let points = array![[0., 0., 0.015], [0.01, -0.01, 0.], [0.03, 0.03, 0.03]];
        assert!(fit.pdf(points.view()).unwrap().iter().all(|&x| x >= 0.));
    }

    #[test]
    fn matrices_are_cached_per_geometry() {
        let m = model(1e-8);
        let signal = crossing_signal(m.gtab());
        let fit = m.fit(signal.view()).unwrap();
        // signal matrix and pseudo inverse
        assert_eq!(m.cached_matrices(), 2);
        m.fit(signal.view()).unwrap();
        assert_eq!(m.cached_matrices(), 2);

        fit.pdf_grid(5, 20e-3).unwrap();
        fit.pdf_grid(5, 20e-3).unwrap();
        assert_eq!(m.cached_matrices(), 3);
        fit.pdf_grid(5, 25e-3).unwrap();
        assert_eq!(m.cached_matrices(), 4);

        let sphere = Sphere::fibonacci(20).unwrap();
        fit.odf(&sphere).unwrap();
        fit.odf(&sphere.clone()).unwrap();
        assert_eq!(m.cached_matrices(), 5);
    }

    #[test]
    fn fit_multi_matches_single_fits() {
        let m = model(1e-8);
        let a = crossing_signal(m.gtab());
        let b = sticks_and_ball(m.gtab(), 0.0015, 1., &[(45., 30.)], &[0.6], None, &mut rand::rng()).unwrap();
        let mut signals = Array2::zeros((2, m.gtab().len()));
        signals.row_mut(0).assign(&a);
        signals.row_mut(1).assign(&b);
        let fits = m.fit_multi(signals.view()).unwrap();
        assert_eq!(fits.len(), 2);
        let single = m.fit(b.view()).unwrap();
        for (x, y) in fits[1].shore_coeff().iter().zip(single.shore_coeff()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
        assert!(m.fit_multi(Array2::zeros((2, 3)).view()).is_err());
    }

    #[test]
    fn scalar_maps_are_floored_at_zero() {
        // rises on the inner shell and turns negative on the outer one
        let m = model(1e-8);
        let signal = Array1::from_iter(m.gtab().bvals().iter().map(|&b| match b {
            b if b < 1. => 1.,
            b if b < 1500. => 3.,
            _ => -3.,
        }));
        let fit = m.fit(signal.view()).unwrap();
        assert_eq!(fit.rtop_signal(), 0.);
        assert_eq!(fit.rtop_pdf(), 0.);
        assert_eq!(fit.msd(), 0.);
    }

    #[test]
    fn rank_deficient_gram_is_singular() {
        // 7 samples against 50 coefficients with no regularization
        let g = GradientTable::multi_shell(&[1000.], 6, 1).unwrap();
        let params = ShoreParams { lambda_n: 0., lambda_l: 0., ..ShoreParams::default() };
        let m = ShoreModel::new(g, params).unwrap();
        let signal = Array1::from_elem(m.gtab().len(), 0.5);
        assert!(matches!(m.fit(signal.view()), Err(ReconError::SingularMatrix(_))));
        let signals = Array2::from_elem((2, m.gtab().len()), 0.5);
        assert!(matches!(m.fit_multi(signals.view()), Err(ReconError::SingularMatrix(_))));
        // nothing is cached for a failed inverse
        assert_eq!(m.cached_matrices(), 1);

        // the same table is well posed once regularized
        let params = ShoreParams { lambda_n: 1e-8, lambda_l: 1e-8, ..ShoreParams::default() };
        let m = ShoreModel::new(m.gtab().clone(), params).unwrap();
        assert!(m.fit(signal.view()).is_ok());
    }

    #[test]
    fn rejects_mismatched_signal() {
        let m = model(1e-8);
        assert!(matches!(m.fit(Array1::zeros(3).view()), Err(ReconError::InvalidParameter(_))));
        let mut s = crossing_signal(m.gtab());
        s[4] = f64::NAN;
        assert!(m.fit(s.view()).is_err());
    }
}
