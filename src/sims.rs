// Synthetic diffusion signals for testing reconstructions

use crate::error::{ReconError, Result};
use crate::gradients::GradientTable;
use crate::special::sphere2cart;
use ndarray::Array1;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Sticks-and-ball signal: an isotropic compartment with diffusivity d plus one stick per
/// (theta, phi) direction in degrees, each with zero perpendicular diffusivity. Fractions are in
/// [0, 1] and the isotropic fraction is what remains. With an snr, Rician noise with
/// sigma = s0 / snr is added.
pub fn sticks_and_ball<R: Rng + ?Sized>(
    gtab: &GradientTable,
    d: f64,
    s0: f64,
    angles: &[(f64, f64)],
    fractions: &[f64],
    snr: Option<f64>,
    rng: &mut R,
) -> Result<Array1<f64>> {
    if angles.len() != fractions.len() {
        return Err(ReconError::invalid(format!(
            "got {} stick directions and {} fractions", angles.len(), fractions.len()
        )));
    }
    if fractions.iter().any(|f| !(0. ..=1.).contains(f)) || fractions.iter().sum::<f64>() > 1. + 1e-12 {
        return Err(ReconError::invalid("stick fractions must lie in [0, 1] and sum to at most 1"));
    }
    if !(d >= 0.) || !(s0 > 0.) {
        return Err(ReconError::invalid(format!("expected d >= 0 and s0 > 0, got d={d} s0={s0}")));
    }
    let f0 = 1. - fractions.iter().sum::<f64>();
    let sticks: Vec<[f64; 3]> = angles.iter()
        .map(|(theta, phi)| sphere2cart(1., theta.to_radians(), phi.to_radians()))
        .collect();

    let mut signal: Array1<f64> = gtab.bvals().iter().zip(gtab.bvecs()).map(|(&b, g)| {
        let aniso: f64 = sticks.iter().zip(fractions).map(|(s, f)| {
            let c = s[0] * g[0] + s[1] * g[1] + s[2] * g[2];
            f * (-b * d * c * c).exp()
        }).sum();
        s0 * (f0 * (-b * d).exp() + aniso)
    }).collect();

    if let Some(snr) = snr {
        if !(snr > 0.) {
            return Err(ReconError::invalid(format!("snr must be positive, got {snr}")));
        }
        let noise = Normal::new(0., s0 / snr)
            .map_err(|e| ReconError::invalid(format!("bad noise level: {e}")))?;
        signal.mapv_inplace(|s| {
            let re = s + noise.sample(rng);
            let im = noise.sample(rng);
            (re * re + im * im).sqrt()
        });
    }
    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn noiseless_signal() {
        let g = GradientTable::new(
            vec![0., 1000., 1000.],
            vec![[0.; 3], [0., 0., 1.], [1., 0., 0.]],
        ).unwrap();
        let d = 0.0015;
        let s = sticks_and_ball(&g, d, 100., &[(0., 0.)], &[0.6], None, &mut rand::rng()).unwrap();
        assert_abs_diff_eq!(s[0], 100., epsilon = 1e-12);
        // along the stick both compartments decay
        assert_abs_diff_eq!(s[1], 100. * (-1.5f64).exp(), epsilon = 1e-10);
        // across the stick only the ball decays
        assert_abs_diff_eq!(s[2], 100. * (0.4 * (-1.5f64).exp() + 0.6), epsilon = 1e-10);
    }

    #[test]
    fn rician_noise_is_positive_and_seeded() {
        let g = GradientTable::multi_shell(&[3000.], 30, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let a = sticks_and_ball(&g, 0.0015, 1., &[(0., 0.)], &[0.5], Some(20.), &mut rng).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let b = sticks_and_ball(&g, 0.0015, 1., &[(0., 0.)], &[0.5], Some(20.), &mut rng).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|&x| x >= 0.));
        let clean = sticks_and_ball(&g, 0.0015, 1., &[(0., 0.)], &[0.5], None, &mut rng).unwrap();
        assert_ne!(a, clean);
    }

    #[test]
    fn rejects_bad_fractions() {
        let g = GradientTable::multi_shell(&[1000.], 5, 1).unwrap();
        assert!(sticks_and_ball(&g, 0.0015, 1., &[(0., 0.)], &[0.6, 0.2], None, &mut rand::rng()).is_err());
        assert!(sticks_and_ball(&g, 0.0015, 1., &[(0., 0.), (90., 0.)], &[0.6, 0.6], None, &mut rand::rng()).is_err());
    }
}
