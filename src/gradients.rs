// Diffusion acquisition geometry (gradient table) and sphere tessellations used to sample
// orientation distribution functions

use crate::error::{ReconError, Result};
use crate::matrix_cache::fingerprint;
use ndarray::Array2;
use std::f64::consts::PI;

/// b-values at or below this threshold are treated as non-diffusion-weighted
pub const DEFAULT_B0_THRESHOLD: f64 = 50.;

const BVEC_NORM_TOLERANCE: f64 = 1e-2;

#[derive(Debug, Clone)]
pub struct GradientTable {
    bvals: Vec<f64>,
    bvecs: Vec<[f64; 3]>,
    big_delta: Option<f64>,
    small_delta: Option<f64>,
    b0_threshold: f64,
}

impl GradientTable {
    /// builds a gradient table from b-values and b-vectors. Diffusion-weighted entries must have
    /// unit b-vectors.
    pub fn new(bvals: Vec<f64>, bvecs: Vec<[f64; 3]>) -> Result<Self> {
        if bvals.is_empty() {
            return Err(ReconError::invalid("gradient table must have at least one entry"));
        }
        if bvals.len() != bvecs.len() {
            return Err(ReconError::invalid(format!(
                "found {} b-values and {} b-vectors", bvals.len(), bvecs.len()
            )));
        }
        if let Some(b) = bvals.iter().find(|b| !b.is_finite() || **b < 0.) {
            return Err(ReconError::invalid(format!("b-values must be finite and non-negative, got {b}")));
        }
        for (i, (b, g)) in bvals.iter().zip(&bvecs).enumerate() {
            if g.iter().any(|x| !x.is_finite()) {
                return Err(ReconError::invalid(format!("b-vector {i} is not finite")));
            }
            let norm = (g[0] * g[0] + g[1] * g[1] + g[2] * g[2]).sqrt();
            if *b > DEFAULT_B0_THRESHOLD && (norm - 1.).abs() > BVEC_NORM_TOLERANCE {
                return Err(ReconError::invalid(format!("b-vector {i} has norm {norm}, expected a unit vector")));
            }
        }
        Ok(Self {
            bvals,
            bvecs,
            big_delta: None,
            small_delta: None,
            b0_threshold: DEFAULT_B0_THRESHOLD,
        })
    }

    /// attaches the diffusion pulse separation and duration
    pub fn with_timing(mut self, big_delta: f64, small_delta: f64) -> Result<Self> {
        if !(big_delta > 0.) || !(small_delta > 0.) || small_delta > big_delta {
            return Err(ReconError::invalid(format!(
                "pulse timing must satisfy 0 < small_delta <= big_delta, got big_delta={big_delta} small_delta={small_delta}"
            )));
        }
        self.big_delta = Some(big_delta);
        self.small_delta = Some(small_delta);
        Ok(self)
    }

    pub fn with_b0_threshold(mut self, b0_threshold: f64) -> Result<Self> {
        if !(b0_threshold >= 0.) {
            return Err(ReconError::invalid("b0 threshold must be non-negative"));
        }
        self.b0_threshold = b0_threshold;
        Ok(self)
    }

    /// a multi-shell scheme with n_b0 non-weighted entries followed by n_dirs quasi-uniform
    /// directions per shell
    pub fn multi_shell(shells: &[f64], n_dirs: usize, n_b0: usize) -> Result<Self> {
        if n_dirs == 0 {
            return Err(ReconError::invalid("at least one direction per shell is required"));
        }
        let dirs = fibonacci_directions(n_dirs);
        let mut bvals = vec![0.; n_b0];
        let mut bvecs = vec![[0.; 3]; n_b0];
        for &b in shells {
            bvals.extend(std::iter::repeat(b).take(n_dirs));
            bvecs.extend_from_slice(&dirs);
        }
        Self::new(bvals, bvecs)
    }

    pub fn bvals(&self) -> &[f64] {
        &self.bvals
    }

    pub fn bvecs(&self) -> &[[f64; 3]] {
        &self.bvecs
    }

    pub fn len(&self) -> usize {
        self.bvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bvals.is_empty()
    }

    pub fn big_delta(&self) -> Option<f64> {
        self.big_delta
    }

    pub fn small_delta(&self) -> Option<f64> {
        self.small_delta
    }

    /// return an index mask of b0 entries
    pub fn b0s_mask(&self) -> Vec<bool> {
        self.bvals.iter().map(|&b| b <= self.b0_threshold).collect()
    }

    /// the diffusion time. Without pulse timing this is the value that makes q equal to sqrt(b).
    pub fn diffusion_time(&self) -> f64 {
        match (self.big_delta, self.small_delta) {
            (Some(big), Some(small)) => big - small / 3.,
            _ => 1. / (4. * PI * PI),
        }
    }

    /// content hash used to key cached design matrices
    pub fn fingerprint(&self) -> u64 {
        let timing = [self.big_delta.unwrap_or(-1.), self.small_delta.unwrap_or(-1.)];
        fingerprint(
            self.bvals.iter().copied()
                .chain(self.bvecs.iter().flatten().copied())
                .chain(timing),
        )
    }
}

/// a set of unit directions on which orientation functions are sampled
#[derive(Debug, Clone)]
pub struct Sphere {
    vertices: Array2<f64>,
}

impl Sphere {
    /// builds a sphere from arbitrary non-zero directions, normalizing each to unit length
    pub fn new(directions: &[[f64; 3]]) -> Result<Self> {
        if directions.is_empty() {
            return Err(ReconError::invalid("sphere must have at least one vertex"));
        }
        let mut vertices = Array2::zeros((directions.len(), 3));
        for (i, d) in directions.iter().enumerate() {
            let norm = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
            if !(norm > 0.) || !norm.is_finite() {
                return Err(ReconError::degenerate(format!("sphere vertex {i} has no direction")));
            }
            for k in 0..3 {
                vertices[[i, k]] = d[k] / norm;
            }
        }
        Ok(Self { vertices })
    }

    /// quasi-uniform sampling of the full sphere with n vertices
    pub fn fibonacci(n: usize) -> Result<Self> {
        Self::new(&fibonacci_directions(n))
    }

    pub fn vertices(&self) -> &Array2<f64> {
        &self.vertices
    }

    pub fn len(&self) -> usize {
        self.vertices.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.nrows() == 0
    }

    pub fn fingerprint(&self) -> u64 {
        fingerprint(self.vertices.iter().copied())
    }
}

/// golden-angle spiral on the unit sphere
fn fibonacci_directions(n: usize) -> Vec<[f64; 3]> {
    let golden_angle = PI * (3. - 5f64.sqrt());
    (0..n).map(|i| {
        let z = 1. - 2. * (i as f64 + 0.5) / n as f64;
        let r = (1. - z * z).max(0.).sqrt();
        let phi = golden_angle * i as f64;
        [r * phi.cos(), r * phi.sin(), z]
    }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn validates_lengths_and_norms() {
        assert!(GradientTable::new(vec![0., 1000.], vec![[0.; 3]]).is_err());
        assert!(GradientTable::new(vec![-1.], vec![[0.; 3]]).is_err());
        assert!(GradientTable::new(vec![1000.], vec![[0.5, 0., 0.]]).is_err());
        assert!(GradientTable::new(vec![0., 1000.], vec![[0.; 3], [0., 0., 1.]]).is_ok());
    }

    #[test]
    fn diffusion_time_defaults() {
        let g = GradientTable::new(vec![0., 1000.], vec![[0.; 3], [1., 0., 0.]]).unwrap();
        assert_abs_diff_eq!(g.diffusion_time(), 1. / (4. * PI * PI), epsilon = 1e-15);
        let g = g.with_timing(0.03, 0.015).unwrap();
        assert_abs_diff_eq!(g.diffusion_time(), 0.025, epsilon = 1e-15);
        assert!(GradientTable::new(vec![0.], vec![[0.; 3]]).unwrap().with_timing(0.01, 0.02).is_err());
    }

    #[test]
    fn multi_shell_layout() {
        let g = GradientTable::multi_shell(&[1000., 2000.], 30, 2).unwrap();
        assert_eq!(g.len(), 62);
        let mask = g.b0s_mask();
        assert_eq!(mask.iter().filter(|&&m| m).count(), 2);
        for v in &g.bvecs()[2..] {
            assert_abs_diff_eq!((v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt(), 1., epsilon = 1e-12);
        }
    }

    #[test]
    fn fingerprint_tracks_timing() {
        let g = GradientTable::multi_shell(&[1000.], 10, 1).unwrap();
        let timed = g.clone().with_timing(0.03, 0.01).unwrap();
        assert_eq!(g.fingerprint(), g.clone().fingerprint());
        assert_ne!(g.fingerprint(), timed.fingerprint());
    }

    #[test]
    fn sphere_normalizes_vertices() {
        let s = Sphere::new(&[[2., 0., 0.], [0., 0., -3.]]).unwrap();
        assert_abs_diff_eq!(s.vertices()[[0, 0]], 1., epsilon = 1e-15);
        assert_abs_diff_eq!(s.vertices()[[1, 2]], -1., epsilon = 1e-15);
        assert!(Sphere::new(&[[0., 0., 0.]]).is_err());
        assert_eq!(Sphere::fibonacci(100).unwrap().len(), 100);
    }
}
