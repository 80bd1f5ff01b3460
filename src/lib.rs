pub mod error;
pub mod special;
pub mod shore_index;
pub mod shore_matrix;
pub mod matrix_cache;
pub mod gradients;
pub mod shore;
pub mod sims;

pub mod streamline;
pub mod quickbundles;
pub mod lsa;
pub mod correspondence;
pub mod registration;
pub mod alignment;
pub mod bundlewarp;

pub mod config;

pub use bundlewarp::{
    assignment_map, average_bundle_length, bundlewarp, bundlewarp_shape_analysis, bundlewarp_vector_field,
    bundlewarp_with, BundleWarp, ShapeProfile, VectorField, WarpParams,
};
pub use config::ReconParams;
pub use error::{ReconError, Result};
pub use gradients::{GradientTable, Sphere};
pub use shore::{ShoreFit, ShoreModel, ShoreParams};
pub use streamline::Streamline;
