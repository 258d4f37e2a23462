use nalgebra::{Isometry3, Matrix3, Matrix6, SMatrix, UnitQuaternion, Vector3, Vector6};

pub type Real = f64;

pub type Vec3 = Vector3<Real>;
pub type Vec6 = Vector6<Real>;
pub type Mat3 = Matrix3<Real>;
pub type Mat6 = Matrix6<Real>;
pub type Mat15 = SMatrix<Real, 15, 15>;
pub type Quat = UnitQuaternion<Real>;
pub type Iso3 = Isometry3<Real>;
