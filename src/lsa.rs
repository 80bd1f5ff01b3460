// Rectangular minimum-cost assignment by shortest augmenting paths (Jonker-Volgenant style, as
// described by Crouse, "On implementing 2D rectangular assignment algorithms", 2016)

use crate::error::{ReconError, Result};
use ndarray::{Array2, ArrayView2};

/// Solves the linear sum assignment problem for a (rows x cols) cost matrix. Returns
/// min(rows, cols) (row, col) pairs sorted by row such that every row and every column is used at
/// most once and the total cost is minimal.
pub fn linear_sum_assignment(cost: ArrayView2<f64>) -> Result<Vec<(usize, usize)>> {
    if cost.iter().any(|c| !c.is_finite()) {
        return Err(ReconError::invalid("cost matrix contains non-finite entries"));
    }
    if cost.is_empty() {
        return Ok(Vec::new());
    }
    let transposed = cost.nrows() > cost.ncols();
    let c: Array2<f64> = if transposed { cost.t().to_owned() } else { cost.to_owned() };
    let col4row = solve_wide(&c)?;

    let mut pairs: Vec<(usize, usize)> = col4row.into_iter().enumerate().collect();
    if transposed {
        pairs = pairs.into_iter().map(|(r, c)| (c, r)).collect();
        pairs.sort_unstable();
    }
    Ok(pairs)
}

/// assignment for a cost matrix with rows <= cols, returning the column of every row
fn solve_wide(c: &Array2<f64>) -> Result<Vec<usize>> {
    let (nr, nc) = c.dim();
    let mut u = vec![0.; nr];
    let mut v = vec![0.; nc];
    let mut shortest = vec![f64::INFINITY; nc];
    let mut path = vec![usize::MAX; nc];
    let mut col4row = vec![usize::MAX; nr];
    let mut row4col = vec![usize::MAX; nc];
    let mut visited_rows = vec![false; nr];
    let mut visited_cols = vec![false; nc];
    let mut remaining = vec![0usize; nc];

    for cur_row in 0..nr {
        shortest.fill(f64::INFINITY);
        visited_rows.fill(false);
        visited_cols.fill(false);
        for (it, r) in remaining.iter_mut().enumerate() {
            *r = nc - it - 1;
        }
        let mut n_remaining = nc;
        let mut min_val = 0.;
        let mut i = cur_row;
        let mut sink = None;

        while sink.is_none() {
            let mut index = None;
            let mut lowest = f64::INFINITY;
            visited_rows[i] = true;
            for (it, &j) in remaining[..n_remaining].iter().enumerate() {
                let r = min_val + c[[i, j]] - u[i] - v[j];
                if r < shortest[j] {
                    path[j] = i;
                    shortest[j] = r;
                }
                if shortest[j] < lowest || (shortest[j] == lowest && row4col[j] == usize::MAX) {
                    lowest = shortest[j];
                    index = Some(it);
                }
            }
            let index = index.ok_or_else(|| ReconError::invalid("cost matrix is infeasible"))?;
            min_val = lowest;
            let j = remaining[index];
            if row4col[j] == usize::MAX {
                sink = Some(j);
            } else {
                i = row4col[j];
            }
            visited_cols[j] = true;
            n_remaining -= 1;
            remaining[index] = remaining[n_remaining];
        }

        // update the dual variables
        u[cur_row] += min_val;
        for r in 0..nr {
            if visited_rows[r] && r != cur_row {
                u[r] += min_val - shortest[col4row[r]];
            }
        }
        for j in 0..nc {
            if visited_cols[j] {
                v[j] -= min_val - shortest[j];
            }
        }

        // augment along the path back to the current row
        let mut j = sink.unwrap_or_default();
        loop {
            let r = path[j];
            row4col[j] = r;
            std::mem::swap(&mut col4row[r], &mut j);
            if r == cur_row {
                break;
            }
        }
    }
    Ok(col4row)
}
