use clap::Parser;
use dmri_reco::{bundlewarp, bundlewarp_shape_analysis, ReconParams, Streamline};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Args {
    /// json file with a static and a moving bundle, each a list of streamlines of [x, y, z] points
    bundles: PathBuf,
    /// recon parameters file. Defaults are used when omitted
    #[arg(long)]
    params: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct BundlesInput {
    #[serde(rename = "static")]
    static_bundle: Vec<Vec<[f64; 3]>>,
    moving: Vec<Vec<[f64; 3]>>,
}

#[derive(Debug, Serialize)]
struct WarpOutput {
    deformed: Vec<Vec<[f64; 3]>>,
    /// (moving, static) index pairs
    pairs: Vec<(usize, usize)>,
    beta: f64,
    profile_mean: Vec<f64>,
    profile_std: Vec<f64>,
}

fn to_streamline(points: &[[f64; 3]]) -> Streamline {
    Array2::from_shape_fn((points.len(), 3), |(i, d)| points[i][d])
}

fn from_streamline(s: &Streamline) -> Vec<[f64; 3]> {
    s.outer_iter().map(|p| [p[0], p[1], p[2]]).collect()
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let params = match &args.params {
        Some(p) => ReconParams::from_file(p).expect("failed to load parameter file"),
        None => ReconParams::default(),
    };

    let input: BundlesInput = serde_json::from_str(
        &fs::read_to_string(&args.bundles).expect("failed to read bundle file")
    ).expect("failed to parse bundle file");
    let static_bundle: Vec<Streamline> = input.static_bundle.iter().map(|s| to_streamline(s)).collect();
    let moving_bundle: Vec<Streamline> = input.moving.iter().map(|s| to_streamline(s)).collect();

    log::info!("warping {} moving onto {} static streamlines", moving_bundle.len(), static_bundle.len());
    let warp = bundlewarp(&static_bundle, &moving_bundle, &params.warp).expect("bundlewarp failed");
    let profile = bundlewarp_shape_analysis(&warp.moving_aligned, &warp.deformed, params.warp.no_disks)
        .expect("shape analysis failed");

    let output = WarpOutput {
        deformed: warp.deformed.iter().map(from_streamline).collect(),
        pairs: warp.correspondence.pairs.clone(),
        beta: warp.beta,
        profile_mean: profile.mean.to_vec(),
        profile_std: profile.std.to_vec(),
    };
    println!("{}", serde_json::to_string_pretty(&output).expect("Can't serialize"));
}
