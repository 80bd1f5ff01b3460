use clap::Parser;
use dmri_reco::ReconParams;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Args {
    /// path to recon parameters file to write
    parameter_file: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let params = ReconParams::default();
    params.to_file(&args.parameter_file).expect("Can't write parameter file");
    println!("wrote default parameter file to {}", args.parameter_file.with_extension("toml").display());
}
