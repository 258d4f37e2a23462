//! Backend-independent intermediate representation of the calibration
//! factor graph.

mod types;

pub use types::{
    quat_from_storage, write_quat_storage, FactorKind, FixedMask, ManifoldKind, ParamBlock,
    ParamId, ProblemIR, ResidualBlock,
};
