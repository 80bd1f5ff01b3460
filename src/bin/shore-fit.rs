use clap::Parser;
use dmri_reco::{GradientTable, ReconParams, ShoreModel, Sphere};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Args {
    /// json file with bvals, bvecs, optional pulse timing and one signal array per voxel
    voxels: PathBuf,
    /// recon parameters file. Defaults are used when omitted
    #[arg(long)]
    params: Option<PathBuf>,
    /// also report the odf on a fibonacci sphere with this many vertices
    #[arg(long)]
    odf_vertices: Option<usize>,
    /// also report the propagator on a grid of this (odd) size
    #[arg(long, requires = "radius_max")]
    grid_size: Option<usize>,
    /// half width of the propagator grid
    #[arg(long, requires = "grid_size")]
    radius_max: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VoxelInput {
    bvals: Vec<f64>,
    bvecs: Vec<[f64; 3]>,
    big_delta: Option<f64>,
    small_delta: Option<f64>,
    signals: Vec<Vec<f64>>,
}

#[derive(Debug, Serialize)]
struct VoxelOutput {
    coefficients: Vec<f64>,
    rtop_signal: f64,
    rtop_pdf: f64,
    msd: f64,
    odf_sh: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    odf: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pdf_grid: Option<Vec<f64>>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let params = match &args.params {
        Some(p) => ReconParams::from_file(p).expect("failed to load parameter file"),
        None => ReconParams::default(),
    };

    let input: VoxelInput = serde_json::from_str(
        &fs::read_to_string(&args.voxels).expect("failed to read voxel file")
    ).expect("failed to parse voxel file");

    let mut gtab = GradientTable::new(input.bvals, input.bvecs).expect("invalid gradient table");
    if let (Some(big_delta), Some(small_delta)) = (input.big_delta, input.small_delta) {
        gtab = gtab.with_timing(big_delta, small_delta).expect("invalid pulse timing");
    }

    let n_grad = gtab.len();
    let n_vox = input.signals.len();
    if let Some(i) = input.signals.iter().position(|s| s.len() != n_grad) {
        panic!("voxel {i} has {} samples, expected {n_grad}", input.signals[i].len());
    }
    let signals = Array2::from_shape_vec((n_vox, n_grad), input.signals.concat()).expect("signal array");

    let model = ShoreModel::new(gtab, params.shore).expect("invalid shore parameters");
    let sphere = args.odf_vertices.map(|n| Sphere::fibonacci(n).expect("invalid sphere"));

    log::info!("fitting {n_vox} voxels");
    let fits = model.fit_multi(signals.view()).expect("fit failed");

    let output: Vec<VoxelOutput> = fits.iter().map(|fit| {
        let pdf_grid = match (args.grid_size, args.radius_max) {
            (Some(g), Some(r)) => Some(fit.pdf_grid(g, r).expect("propagator grid failed").into_iter().collect()),
            _ => None,
        };
        VoxelOutput {
            coefficients: fit.shore_coeff().to_vec(),
            rtop_signal: fit.rtop_signal(),
            rtop_pdf: fit.rtop_pdf(),
            msd: fit.msd(),
            odf_sh: fit.odf_sh().to_vec(),
            odf: sphere.as_ref().map(|s| fit.odf(s).expect("odf failed").to_vec()),
            pdf_grid,
        }
    }).collect();

    println!("{}", serde_json::to_string_pretty(&output).expect("Can't serialize"));
}
