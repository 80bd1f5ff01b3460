// QuickBundles clustering of streamlines with the orientation-aware average point-wise distance

use crate::error::{ReconError, Result};
use crate::streamline::{direct_flip, validate_bundle, Streamline};
use ndarray::{s, Array2, ArrayView2, Zip};

#[derive(Debug, Clone)]
pub struct Cluster {
    /// running mean of the (orientation-aligned) members
    pub centroid: Array2<f64>,
    /// indices of the member streamlines in the clustered bundle
    pub indices: Vec<usize>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn add(&mut self, index: usize, streamline: ArrayView2<f64>) {
        let n = self.indices.len() as f64;
        Zip::from(&mut self.centroid).and(streamline).for_each(|c, &x| {
            *c = (*c * n + x) / (n + 1.);
        });
        self.indices.push(index);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuickBundles {
    /// maximum average point-wise distance between a streamline and its cluster centroid
    pub threshold: f64,
}

impl QuickBundles {
    pub fn new(threshold: f64) -> Result<Self> {
        if !(threshold > 0.) || !threshold.is_finite() {
            return Err(ReconError::invalid(format!("clustering threshold must be positive, got {threshold}")));
        }
        Ok(Self { threshold })
    }

    /// clusters a bundle in a single pass. Every streamline must have the same number of points.
    /// A streamline joins the closest cluster when its distance to the centroid is below the
    /// threshold, flipped first if the reversed orientation is closer.
    pub fn cluster(&self, bundle: &[Streamline]) -> Result<Vec<Cluster>> {
        validate_bundle(bundle, "clustered")?;
        let n_points = bundle[0].nrows();
        if bundle.iter().any(|s| s.nrows() != n_points) {
            return Err(ReconError::invalid("streamlines must be resampled to a common number of points before clustering"));
        }

        let mut clusters: Vec<Cluster> = Vec::new();
        for (i, streamline) in bundle.iter().enumerate() {
            let mut nearest: Option<(usize, f64, bool)> = None;
            for (k, c) in clusters.iter().enumerate() {
                let (direct, flipped) = direct_flip(c.centroid.view(), streamline.view());
                let (d, flip) = if flipped < direct { (flipped, true) } else { (direct, false) };
                if nearest.map_or(true, |(_, best, _)| d < best) {
                    nearest = Some((k, d, flip));
                }
            }
            match nearest {
                Some((k, d, flip)) if d < self.threshold => {
                    if flip {
                        clusters[k].add(i, streamline.slice(s![..;-1, ..]));
                    } else {
                        clusters[k].add(i, streamline.view());
                    }
                }
                _ => clusters.push(Cluster { centroid: streamline.clone(), indices: vec![i] }),
            }
        }
        log::debug!("quickbundles: {} streamlines in {} clusters", bundle.len(), clusters.len());
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streamline::tests::line;
    use approx::assert_abs_diff_eq;
    use ndarray::Axis;

    #[test]
    fn separates_distant_groups() {
        let bundle = vec![
            line(0., 0., 50., 10),
            line(100., 0., 50., 10),
            line(1., 0., 50., 10),
            line(101., 0., 50., 10),
        ];
        let clusters = QuickBundles::new(10.).unwrap().cluster(&bundle).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].indices, vec![0, 2]);
        assert_eq!(clusters[1].indices, vec![1, 3]);
        assert_abs_diff_eq!(clusters[0].centroid[[0, 0]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn flipped_members_are_reoriented() {
        let a = line(0., 0., 50., 10);
        let mut b = line(2., 0., 50., 10);
        b.invert_axis(Axis(0));
        let clusters = QuickBundles::new(10.).unwrap().cluster(&[a, b]).unwrap();
        assert_eq!(clusters.len(), 1);
        let c = &clusters[0].centroid;
        assert_abs_diff_eq!(c[[0, 0]], 1., epsilon = 1e-12);
        assert_abs_diff_eq!(c[[0, 1]], 0., epsilon = 1e-12);
        assert_abs_diff_eq!(c[[9, 1]], 50., epsilon = 1e-12);
    }

    #[test]
    fn rejects_mixed_resolution() {
        let bundle = vec![line(0., 0., 50., 10), line(0., 0., 50., 12)];
        assert!(QuickBundles::new(10.).unwrap().cluster(&bundle).is_err());
        assert!(QuickBundles::new(0.).is_err());
    }
}
