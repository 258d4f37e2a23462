//! Keyframe timestamp catalog.
//!
//! The catalog owns the ordered list of calibration keyframes. Timestamps
//! are sorted and deduplicated on construction; dense indices are assigned
//! once, by the first IMU coverage filter, and stay stable afterwards so
//! parameter names survive later drops.

use vical_core::{ImuPropagator, Real};

use crate::error::VicalError;

/// A single calibration keyframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keyframe {
    /// Dense index assigned by the coverage filter, used in parameter names.
    pub index: usize,
    /// Timestamp in seconds.
    pub t: Real,
}

/// Ordered collection of calibration keyframes.
#[derive(Debug, Clone)]
pub struct KeyframeCatalog {
    frames: Vec<Keyframe>,
    filtered: bool,
}

impl KeyframeCatalog {
    /// Builds a catalog from raw timestamps, sorting and deduplicating.
    pub fn from_times(times: &[Real]) -> Result<Self, VicalError> {
        let mut sorted: Vec<Real> = times.iter().copied().filter(|t| t.is_finite()).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted.dedup();
        if sorted.is_empty() {
            return Err(VicalError::Configuration(
                "no finite keyframe timestamps provided".into(),
            ));
        }
        let frames = sorted
            .into_iter()
            .enumerate()
            .map(|(index, t)| Keyframe { index, t })
            .collect();
        Ok(Self {
            frames,
            filtered: false,
        })
    }

    /// Drops keyframes outside the propagator's IMU coverage.
    ///
    /// Assigns dense indices on the first call; subsequent calls only
    /// remove frames and keep the existing indices. Returns the number of
    /// dropped keyframes.
    pub fn filter_by_imu(&mut self, imu: &dyn ImuPropagator) -> Result<usize, VicalError> {
        let before = self.frames.len();
        self.frames.retain(|kf| imu.has_bounding_imu(kf.t));
        if self.frames.is_empty() {
            return Err(VicalError::Configuration(
                "no keyframes inside the IMU coverage window".into(),
            ));
        }
        if !self.filtered {
            for (index, kf) in self.frames.iter_mut().enumerate() {
                kf.index = index;
            }
            self.filtered = true;
        }
        Ok(before - self.frames.len())
    }

    /// Removes keyframes whose dense index is in `indices`.
    pub fn remove_indices(&mut self, indices: &[usize]) {
        if indices.is_empty() {
            return;
        }
        self.frames.retain(|kf| !indices.contains(&kf.index));
    }

    /// Keyframes in time order.
    pub fn frames(&self) -> &[Keyframe] {
        &self.frames
    }

    /// Number of keyframes currently in the catalog.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
