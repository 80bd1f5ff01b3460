// Special functions used by the SHORE basis: generalized Laguerre polynomials, terminating Gauss
// hypergeometric series, real spherical harmonics and the spherical coordinate conversion

use statrs::function::factorial::factorial;
use statrs::function::gamma::gamma as statrs_gamma;
use std::f64::consts::PI;

/// gamma function
#[inline]
pub fn gamma(x: f64) -> f64 {
    statrs_gamma(x)
}

/// n! as a float
#[inline]
pub fn fact(n: u32) -> f64 {
    factorial(n as u64)
}

/// generalized Laguerre polynomial L_n^(alpha)(x) evaluated with the three-term recurrence
pub fn genlaguerre(n: u32, alpha: f64, x: f64) -> f64 {
    if n == 0 {
        return 1.;
    }
    let mut l_prev = 1.;
    let mut l_curr = 1. + alpha - x;
    for k in 1..n {
        let k = k as f64;
        let l_next = ((2. * k + 1. + alpha - x) * l_curr - (k + alpha) * l_prev) / (k + 1.);
        l_prev = l_curr;
        l_curr = l_next;
    }
    l_curr
}

/// Gauss hypergeometric function 2F1(-degree, b; c; z). With a non-positive integer first argument
/// the series terminates after degree + 1 terms and is valid for any z.
pub fn hyp2f1_terminating(degree: u32, b: f64, c: f64, z: f64) -> f64 {
    let a = -(degree as f64);
    let mut term = 1.;
    let mut sum = 1.;
    for k in 0..degree {
        let k = k as f64;
        term *= (a + k) * (b + k) / ((c + k) * (k + 1.)) * z;
        sum += term;
    }
    sum
}

/// associated Legendre function P_l^m(x) for m >= 0, including the Condon-Shortley phase
fn legendre_p(l: u32, m: u32, x: f64) -> f64 {
    let mut p_mm = 1.;
    if m > 0 {
        let s = (1. - x * x).max(0.).sqrt();
        let mut odd = 1.;
        for _ in 0..m {
            p_mm *= -odd * s;
            odd += 2.;
        }
    }
    if l == m {
        return p_mm;
    }
    let mut p_m1 = x * (2 * m + 1) as f64 * p_mm;
    if l == m + 1 {
        return p_m1;
    }
    for ll in (m + 2)..=l {
        let p_ll = ((2 * ll - 1) as f64 * x * p_m1 - (ll + m - 1) as f64 * p_mm) / (ll - m) as f64;
        p_mm = p_m1;
        p_m1 = p_ll;
    }
    p_m1
}

/// real spherical harmonic of degree l and order m. theta is the polar angle, phi the azimuth.
/// positive orders take the imaginary part and negative orders the real part of Y_l^|m|,
/// both scaled by sqrt(2).
pub fn real_sph_harm(m: i32, l: u32, theta: f64, phi: f64) -> f64 {
    let am = m.unsigned_abs();
    debug_assert!(am <= l, "|m| must not exceed l");
    let norm = ((2 * l + 1) as f64 / (4. * PI) * fact(l - am) / fact(l + am)).sqrt();
    let p = legendre_p(l, am, theta.cos());
    match m {
        0 => norm * p,
        m if m > 0 => std::f64::consts::SQRT_2 * norm * p * (am as f64 * phi).sin(),
        _ => std::f64::consts::SQRT_2 * norm * p * (am as f64 * phi).cos(),
    }
}

/// cartesian to spherical coordinates (r, polar, azimuth). The polar angle of the origin is 0.
pub fn cart2sphere(x: f64, y: f64, z: f64) -> (f64, f64, f64) {
    let r = (x * x + y * y + z * z).sqrt();
    let theta = if r > 0. { (z / r).clamp(-1., 1.).acos() } else { 0. };
    let phi = y.atan2(x);
    (r, theta, phi)
}

/// spherical (r, polar, azimuth) to cartesian coordinates
pub fn sphere2cart(r: f64, theta: f64, phi: f64) -> [f64; 3] {
    let sin_theta = theta.sin();
    [r * sin_theta * phi.cos(), r * sin_theta * phi.sin(), r * theta.cos()]
}

/// position of the real spherical harmonic (l, m) in an even-degree harmonic series
#[inline]
pub fn sph_harm_index(l: u32, m: i32) -> usize {
    ((l * (l + 1) / 2) as i64 + m as i64) as usize
}

/// number of even-degree real spherical harmonics up to and including sh_order
#[inline]
pub fn sph_harm_count(sh_order: u32) -> usize {
    ((sh_order + 1) * (sh_order + 2) / 2) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn laguerre_known_values() {
        // L_2^(a)(x) = ((a+1)(a+2) - 2(a+2)x + x^2) / 2
        let (a, x) = (0.5, 1.3);
        let expected = ((a + 1.) * (a + 2.) - 2. * (a + 2.) * x + x * x) / 2.;
        assert_abs_diff_eq!(genlaguerre(2, a, x), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(genlaguerre(1, a, x), 1. + a - x, epsilon = 1e-12);
        // L_n^(a)(0) = binom(n + a, n)
        let l3 = genlaguerre(3, 0.5, 0.);
        assert_abs_diff_eq!(l3, gamma(3. + 1.5) / (gamma(4.) * gamma(1.5)), epsilon = 1e-12);
    }

    #[test]
    fn hypergeometric_terminates() {
        assert_abs_diff_eq!(hyp2f1_terminating(0, 2.5, 1.5, 2.), 1., epsilon = 1e-15);
        // 2F1(-1, b; c; z) = 1 - b z / c
        assert_abs_diff_eq!(hyp2f1_terminating(1, 2.5, 1.5, 2.), 1. - 2.5 * 2. / 1.5, epsilon = 1e-12);
        // 2F1(-2, b; c; z) = 1 - 2bz/c + b(b+1)z^2 / (c(c+1))
        let (b, c, z) = (1.5, 2.5, 2.);
        let expected = 1. - 2. * b * z / c + b * (b + 1.) * z * z / (c * (c + 1.));
        assert_abs_diff_eq!(hyp2f1_terminating(2, b, c, z), expected, epsilon = 1e-12);
    }

    #[test]
    fn low_order_harmonics() {
        let (theta, phi) = (0.7, 1.9);
        assert_abs_diff_eq!(real_sph_harm(0, 0, theta, phi), 0.5 / PI.sqrt(), epsilon = 1e-12);
        let y20 = (5. / (16. * PI)).sqrt() * (3. * theta.cos().powi(2) - 1.);
        assert_abs_diff_eq!(real_sph_harm(0, 2, theta, phi), y20, epsilon = 1e-12);
        // m = 2 uses sin(2 phi), m = -2 cos(2 phi)
        let c = (15. / (32. * PI)).sqrt() * theta.sin().powi(2);
        assert_abs_diff_eq!(real_sph_harm(2, 2, theta, phi), 2f64.sqrt() * c * (2. * phi).sin(), epsilon = 1e-12);
        assert_abs_diff_eq!(real_sph_harm(-2, 2, theta, phi), 2f64.sqrt() * c * (2. * phi).cos(), epsilon = 1e-12);
    }

    #[test]
    fn origin_maps_to_zero_angle() {
        let (r, theta, phi) = cart2sphere(0., 0., 0.);
        assert_eq!(r, 0.);
        assert_eq!(theta, 0.);
        assert_eq!(phi, 0.);
        assert!(real_sph_harm(1, 2, theta, phi).is_finite());
    }

    #[test]
    fn spherical_round_trip() {
        let v = sphere2cart(2., 0.4, -2.1);
        let (r, theta, phi) = cart2sphere(v[0], v[1], v[2]);
        assert_abs_diff_eq!(r, 2., epsilon = 1e-12);
        assert_abs_diff_eq!(theta, 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(phi, -2.1, epsilon = 1e-12);
    }

    #[test]
    fn harmonic_indexing() {
        assert_eq!(sph_harm_index(0, 0), 0);
        assert_eq!(sph_harm_index(2, -2), 1);
        assert_eq!(sph_harm_index(2, 2), 5);
        assert_eq!(sph_harm_index(4, -4), 6);
        assert_eq!(sph_harm_count(4), 15);
        assert_eq!(sph_harm_index(6, 6) + 1, sph_harm_count(6));
    }
}
