// Typed cache of design matrices owned by a model instance. Entries are keyed on the kind of
// matrix and on the identity of the sample geometry it was evaluated on.

use crate::error::Result;
use ndarray::Array2;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// the basis a cached matrix evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixKind {
    Signal,
    /// (M^T M + lambda_n N + lambda_l L)^-1 M^T for the model's gradient table
    SignalPseudoInverse,
    Propagator,
    Odf,
}

/// identity of the sample geometry a matrix was evaluated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKey {
    /// fingerprint of a gradient table
    Gradients(u64),
    /// symmetric propagator grid, keyed on size and the bit pattern of its radius
    Grid { size: usize, radius_bits: u64 },
    /// fingerprint of an arbitrary set of real-space points
    Points(u64),
    /// fingerprint of a sphere tessellation
    Sphere(u64),
}

/// hashes the bit patterns of a sequence of floats
pub fn fingerprint(values: impl IntoIterator<Item = f64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    let mut count = 0usize;
    for v in values {
        v.to_bits().hash(&mut hasher);
        count += 1;
    }
    count.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Default)]
pub struct MatrixCache {
    entries: Mutex<HashMap<(MatrixKind, GeometryKey), Arc<Array2<f64>>>>,
}

impl MatrixCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// returns the cached matrix for the key, building and storing it on a miss. The lock is not
    /// held while building, so builders may run rayon work and be called from inside rayon jobs.
    /// Concurrent misses on the same key may each build; the first stored matrix is kept.
    pub fn get_or_try_insert_with<F>(&self, kind: MatrixKind, key: GeometryKey, build: F) -> Result<Arc<Array2<f64>>>
    where
        F: FnOnce() -> Result<Array2<f64>>,
    {
        if let Some(m) = self.lock().get(&(kind, key)) {
            return Ok(Arc::clone(m));
        }
        log::debug!("building {:?} matrix for {:?}", kind, key);
        let built = Arc::new(build()?);
        let mut entries = self.lock();
        Ok(Arc::clone(entries.entry((kind, key)).or_insert(built)))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(MatrixKind, GeometryKey), Arc<Array2<f64>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
