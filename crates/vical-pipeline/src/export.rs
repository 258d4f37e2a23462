//! Result export (trajectory CSV and calibration report).

use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::Path;

use csv::WriterBuilder;
use log::info;

use crate::error::VicalError;
use crate::solver::CalibrationResult;

/// Writes the keyframe navigation states as a CSV trajectory.
///
/// One row per state, timestamps in integer nanoseconds, quaternion
/// scalar-first. An existing file is replaced; missing parent directories
/// are created.
pub fn write_states_csv(result: &CalibrationResult, path: &Path) -> Result<(), VicalError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    let mut writer = WriterBuilder::new().from_path(path)?;
    writer.write_record([
        "time(ns)", "px", "py", "pz", "qw", "qx", "qy", "qz", "vx", "vy", "vz", "bgx", "bgy",
        "bgz", "bax", "bay", "baz",
    ])?;
    for state in &result.states {
        let time_ns = (state.t * 1e9).floor() as i64;
        let mut record = vec![time_ns.to_string()];
        let q = &state.q_wi.coords;
        for v in [
            state.p.x, state.p.y, state.p.z, q.w, q.x, q.y, q.z, state.v.x, state.v.y, state.v.z,
            state.bg.x, state.bg.y, state.bg.z, state.ba.x, state.ba.y, state.ba.z,
        ] {
            record.push(format!("{v:.6}"));
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    info!("wrote {} states to {}", result.states.len(), path.display());
    Ok(())
}

/// Writes a human-readable calibration report.
pub fn write_info_report(result: &CalibrationResult, path: &Path) -> Result<(), VicalError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    let mut file = File::create(path)?;
    let r = &result.rotation;
    writeln!(file, "extrinsic rotation R_ib (body to imu):")?;
    for i in 0..3 {
        writeln!(file, "  {:+.9} {:+.9} {:+.9}", r[(i, 0)], r[(i, 1)], r[(i, 2)])?;
    }
    let q = &result.quaternion.coords;
    writeln!(
        file,
        "quaternion q_ib (w, x, y, z): {:+.9} {:+.9} {:+.9} {:+.9}",
        q.w, q.x, q.y, q.z
    )?;
    let p = &result.translation;
    writeln!(
        file,
        "translation p_b_i (body origin in imu frame): {:+.9} {:+.9} {:+.9}",
        p.x, p.y, p.z
    )?;
    let g = &result.gravity;
    writeln!(
        file,
        "gravity in world frame: {:+.9} {:+.9} {:+.9} (norm {:.9})",
        g.x,
        g.y,
        g.z,
        g.norm()
    )?;
    writeln!(file, "time offset (s): {:+.9}", result.time_offset)?;
    info!("wrote calibration report to {}", path.display());
    Ok(())
}
