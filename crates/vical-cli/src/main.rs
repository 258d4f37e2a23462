use std::{error::Error, fs, path::Path, path::PathBuf};

use clap::Parser;
use log::info;

use vical_pipeline::{
    write_info_report, write_states_csv, CalibrationConfig, CalibrationSolver, RecordedDataset,
};

/// Mocap-IMU extrinsic calibration over a recorded dataset.
#[derive(Debug, Parser)]
#[command(author, version, about = "Mocap-IMU calibration pipeline")]
struct Args {
    /// Path to a JSON RecordedDataset.
    #[arg(long)]
    dataset: PathBuf,

    /// Optional path to a JSON CalibrationConfig. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory receiving states.csv and calibration_info.txt.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn Error>> {
    let data = fs::read_to_string(path)?;
    let value = serde_json::from_str(&data)?;
    Ok(value)
}

fn run_calibration(args: &Args) -> Result<(), Box<dyn Error>> {
    let config = if let Some(cfg_path) = &args.config {
        load_json_file::<CalibrationConfig>(cfg_path)?
    } else {
        CalibrationConfig::default()
    };

    let dataset = RecordedDataset::load(&args.dataset)?;
    let (imu, poses, keyframes) = dataset.into_sources();
    info!("loaded dataset with {} keyframes", keyframes.len());

    let mut solver = CalibrationSolver::new(config, &keyframes, imu, poses)?;
    solver.run(&|| false)?;
    let result = solver
        .result()
        .ok_or("calibration finished without a result")?;

    let states_path = args.output_dir.join("states.csv");
    let info_path = args.output_dir.join("calibration_info.txt");
    write_states_csv(result, &states_path)?;
    write_info_report(result, &info_path)?;

    let q = &result.quaternion.coords;
    println!("quaternion q_ib (w, x, y, z): {:.6} {:.6} {:.6} {:.6}", q.w, q.x, q.y, q.z);
    println!(
        "translation p_b_i: {:.6} {:.6} {:.6}",
        result.translation.x, result.translation.y, result.translation.z
    );
    println!(
        "gravity: {:.6} {:.6} {:.6} (norm {:.6})",
        result.gravity.x,
        result.gravity.y,
        result.gravity.z,
        result.gravity.norm()
    );
    println!("time offset: {:.6} s", result.time_offset);
    println!("states written to {}", states_path.display());
    Ok(())
}

fn main() {
    pretty_env_logger::init();
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    run_calibration(&args)
}
