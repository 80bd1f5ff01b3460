// One-to-one-or-more streamline correspondence between a moving and a static bundle

use crate::error::{ReconError, Result};
use crate::lsa::linear_sum_assignment;
use ndarray::{ArrayView2, Axis};

/// pairing of every moving streamline with a static streamline
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondence {
    /// (moving index, static index), one entry per moving streamline in moving order
    pub pairs: Vec<(usize, usize)>,
    /// distance of each pair
    pub distances: Vec<f64>,
    /// number of assignment rounds that were needed
    pub rounds: usize,
}

impl Correspondence {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// static streamline matched to a moving streamline
    pub fn static_of(&self, moving: usize) -> Option<usize> {
        self.pairs.get(moving).map(|p| p.1)
    }
}

/// Matches every moving streamline (rows) to a static streamline (columns) of a distance matrix.
/// Each round solves an optimal assignment between the still unmatched moving streamlines and all
/// static streamlines. With more moving than static streamlines static indices are reused across
/// rounds. Every round matches at least one streamline so at most one round per moving streamline
/// is run.
pub fn match_streamlines(dist: ArrayView2<f64>) -> Result<Correspondence> {
    let (n_moving, n_static) = dist.dim();
    if n_moving == 0 || n_static == 0 {
        return Err(ReconError::degenerate(format!(
            "cannot match {n_moving} moving streamlines against {n_static} static streamlines"
        )));
    }
    if dist.iter().any(|d| !d.is_finite()) {
        return Err(ReconError::invalid("distance matrix contains non-finite entries"));
    }

    let mut matched: Vec<Option<usize>> = vec![None; n_moving];
    let mut unmatched: Vec<usize> = (0..n_moving).collect();
    let mut rounds = 0;
    while !unmatched.is_empty() {
        if rounds == n_moving {
            return Err(ReconError::degenerate(format!(
                "{} moving streamlines left unmatched after {rounds} rounds", unmatched.len()
            )));
        }
        let sub = dist.select(Axis(0), &unmatched);
        let pairs = linear_sum_assignment(sub.view())?;
        if pairs.is_empty() {
            return Err(ReconError::degenerate("assignment round matched no streamlines"));
        }
        for (row, col) in pairs {
            matched[unmatched[row]] = Some(col);
        }
        unmatched.retain(|&m| matched[m].is_none());
        rounds += 1;
        log::debug!("correspondence round {rounds}: {} moving streamlines unmatched", unmatched.len());
    }

    let pairs: Vec<(usize, usize)> = matched.iter()
        .enumerate()
        .filter_map(|(m, s)| s.map(|s| (m, s)))
        .collect();
    let distances = pairs.iter().map(|&(m, s)| dist[[m, s]]).collect();
    Ok(Correspondence { pairs, distances, rounds })
}
