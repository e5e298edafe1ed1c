//! Distance evaluation: turns positions into float keys and resets the value
//! array to the identity permutation, one element per invocation.

use std::fmt;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::device::{group_count, Arena, BufferId, Device, Kernel};
use crate::Result;

/// Invocations per group of the `distance` kernel
pub const EVAL_GROUP_SIZE: usize = 256;

/// A position in space. Uploaded as three consecutive float words.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Point3 {
    #[allow(missing_docs)]
    pub x: f32,
    #[allow(missing_docs)]
    pub y: f32,
    #[allow(missing_docs)]
    pub z: f32,
}

impl Point3 {
    /// New point
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Origin
    pub const ZERO: Point3 = Point3::new(0.0, 0.0, 0.0);

    /// Squared Euclidean distance to `other`
    #[inline]
    pub fn distance_squared(&self, other: Point3) -> f32 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        dx * dx + dy * dy + dz * dz
    }
}

impl From<[f32; 3]> for Point3 {
    fn from(p: [f32; 3]) -> Self {
        Self::new(p[0], p[1], p[2])
    }
}

/// Scalar used as the sort key of a position
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "basic", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `|p - t|²`; same order as Euclidean, no square root
    #[default]
    Squared,
    /// `|p - t|`
    Euclidean,
}

impl DistanceMetric {
    /// Key of `p` relative to `target`
    #[inline]
    pub fn measure(&self, p: Point3, target: Point3) -> f32 {
        let d2 = p.distance_squared(target);
        match self {
            DistanceMetric::Squared => d2,
            DistanceMetric::Euclidean => d2.sqrt(),
        }
    }

    /// Id passed to the device programs
    pub fn code(&self) -> u32 {
        match self {
            DistanceMetric::Squared => 0,
            DistanceMetric::Euclidean => 1,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Squared => write!(f, "squared"),
            Self::Euclidean => write!(f, "euclidean"),
        }
    }
}

/// Dispatches the `distance` kernel
#[derive(Clone, Copy, Debug, Default)]
pub struct DistanceEvaluator {
    metric: DistanceMetric,
}

impl DistanceEvaluator {
    /// Evaluator for `metric`
    pub fn new(metric: DistanceMetric) -> Self {
        Self { metric }
    }

    /// Groups needed to cover `len` elements
    pub fn groups(len: usize) -> u32 {
        group_count(len, EVAL_GROUP_SIZE)
    }

    /// Writes `out.keys[i] = metric(positions[i], target)` and `out.values[i] = i`
    /// for `i < len`. Must run again whenever the positions change.
    pub fn evaluate<D: Device>(
        &self,
        device:    &mut D,
        positions: BufferId,
        out:       Arena,
        target:    Point3,
        len:       usize,
    ) -> Result<()> {
        let groups = Self::groups(len);
        log::debug!("Evaluating {} distances to {:?} in {} groups", len, target, groups);
        let kernel = Kernel::Distance {
            positions,
            out,
            target,
            metric: self.metric,
            len: len as u32,
        };
        device.dispatch(&kernel, groups)
    }
}
