// Basis index enumeration for the modified 3D-SHORE basis. The ordering produced here is shared by
// every matrix builder, regularization diagonal and coefficient vector in the crate:
// outer loop over even l, middle loop over n = l ..= (radial_order + l) / 2, inner loop over m = -l ..= l

use crate::error::{ReconError, Result};

/// a single (n, l, m) triple of the SHORE basis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BasisIndex {
    pub n: u32,
    pub l: u32,
    pub m: i32,
}

impl BasisIndex {
    /// the radial order of the Laguerre polynomial attached to this basis function
    #[inline]
    pub fn radial_degree(&self) -> u32 {
        self.n - self.l
    }

    /// the exponent of the sign factor (-1)^(n - l/2) used by the propagator and odf bases
    #[inline]
    pub fn sign(&self) -> f64 {
        if (self.n - self.l / 2) % 2 == 0 { 1. } else { -1. }
    }
}

/// returns an error if the radial order is not a non-zero even number
pub fn validate_radial_order(radial_order: u32) -> Result<()> {
    if radial_order == 0 || radial_order % 2 != 0 {
        return Err(ReconError::invalid(format!(
            "radial_order must be a non-zero even positive number, got {radial_order}"
        )));
    }
    Ok(())
}

/// number of coefficients of the truncated basis: (F+1)(F+2)(4F+3)/6 with F = radial_order / 2
pub fn basis_size(radial_order: u32) -> Result<usize> {
    validate_radial_order(radial_order)?;
    let f = u64::from(radial_order / 2);
    (f + 1)
        .checked_mul(f + 2)
        .and_then(|x| x.checked_mul(4 * f + 3))
        .and_then(|x| usize::try_from(x / 6).ok())
        .ok_or_else(|| ReconError::invalid(format!("radial_order {radial_order} has too many coefficients")))
}

/// number of (n, m) pairs in the block of an even l, for a given radial order
#[inline]
fn block_size(radial_order: u64, l: u64) -> u64 {
    (2 * l + 1) * ((radial_order + l) / 2 - l + 1)
}

/// the canonical ordered sequence of basis triples for a radial order
pub fn basis_indices(radial_order: u32) -> Result<Vec<BasisIndex>> {
    let n_c = basis_size(radial_order)?;
    let mut indices = Vec::with_capacity(n_c);
    for l in (0..=radial_order).step_by(2) {
        for n in l..=(radial_order + l) / 2 {
            let l_i = l as i32;
            for m in -l_i..=l_i {
                indices.push(BasisIndex { n, l, m });
            }
        }
    }
    debug_assert_eq!(indices.len(), n_c);
    Ok(indices)
}

/// returns the (n, l, m) triple found at a zero-based position of the basis
pub fn shore_indices(radial_order: u32, index: usize) -> Result<BasisIndex> {
    let size = basis_size(radial_order)?;
    if index >= size {
        return Err(ReconError::OutOfRange { index, size });
    }
    let r = u64::from(radial_order);
    let mut rest = index as u64;
    for l in (0..=r).step_by(2) {
        let block = block_size(r, l);
        if rest < block {
            let width = 2 * l + 1;
            return Ok(BasisIndex {
                n: (l + rest / width) as u32,
                l: l as u32,
                m: (rest % width) as i32 - l as i32,
            });
        }
        rest -= block;
    }
    Err(ReconError::OutOfRange { index, size })
}

/// given a basis triple, returns the smallest even radial order whose enumeration contains the triple,
/// along with the position of the triple in that enumeration. Within an order the radial index n
/// runs up to (radial_order + l) / 2, so the smallest containing order is 2n - l (at least 2).
pub fn shore_order(n: i64, l: i64, m: i64) -> Result<(u32, usize)> {
    let invalid = || ReconError::InvalidIndex { n, l, m };
    if l % 2 != 0 || l > n || l < 0 || n < 0 || m.abs() > l {
        return Err(invalid());
    }
    let radial_order = n.checked_mul(2)
        .map(|two_n| (two_n - l).max(2))
        .and_then(|order| u32::try_from(order).ok())
        .ok_or_else(invalid)?;
    let (r, n, l) = (u64::from(radial_order), n as u64, l as u64);
    let mut index = 0u64;
    for l_prev in (0..l).step_by(2) {
        index = index.checked_add(block_size(r, l_prev)).ok_or_else(invalid)?;
    }
    let width = 2 * l + 1;
    let index = (n - l).checked_mul(width)
        .and_then(|x| x.checked_add((m + l as i64) as u64))
        .and_then(|x| x.checked_add(index))
        .and_then(|x| usize::try_from(x).ok())
        .ok_or_else(invalid)?;
    Ok((radial_order, index))
}
