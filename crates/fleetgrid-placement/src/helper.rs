//! Pieces shared by several in-tree plugins.

use fleetgrid_framework::{CycleState, FrameworkError, Status};
use fleetgrid_state::{Host, NodeInfo};

/// Host behind `node`; a ghost entry is an internal error.
pub(crate) fn host_of(node: &NodeInfo) -> Result<&Host, Status> {
    node.host().ok_or_else(|| Status::error("node not found"))
}

pub(crate) fn read_state<'a, T: 'static>(state: &'a CycleState, key: &str) -> Result<&'a T, Status> {
    state
        .read::<T>(key)
        .ok_or_else(|| Status::error(format!("reading {key:?} from cycle state: not found")))
}

pub(crate) fn read_state_mut<'a, T: 'static>(
    state: &'a mut CycleState,
    key: &str,
) -> Result<&'a mut T, Status> {
    state
        .read_mut::<T>(key)
        .ok_or_else(|| Status::error(format!("reading {key:?} from cycle state: not found")))
}

pub(crate) fn invalid_args(plugin: &str, reason: impl Into<String>) -> FrameworkError {
    FrameworkError::InvalidArgs {
        plugin: plugin.to_string(),
        reason: reason.into(),
    }
}

/// A `(topology key, value)` domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TopologyPair {
    pub key: String,
    pub value: String,
}

impl TopologyPair {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

// ── Shape functions ────────────────────────────────────────────────

/// One breakpoint of a piecewise-linear utilization → score mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionShapePoint {
    pub utilization: i64,
    pub score: i64,
}

/// Piecewise-linear function over ascending breakpoints. Values left of
/// the first point take its score, values right of the last point take
/// the last score. Interpolation uses integer arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenLinear {
    shape: Vec<FunctionShapePoint>,
}

impl BrokenLinear {
    /// `shape` must be sorted by utilization.
    pub fn new(shape: Vec<FunctionShapePoint>) -> Self {
        Self { shape }
    }

    /// Interpolate the score at utilization `p`, clamped to the first and last
    /// breakpoints.
    pub fn eval(&self, p: i64) -> i64 {
        for (i, point) in self.shape.iter().enumerate() {
            if p <= point.utilization {
                if i == 0 {
                    return point.score;
                }
                let prev = self.shape[i - 1];
                return prev.score
                    + (point.score - prev.score) * (p - prev.utilization)
                        / (point.utilization - prev.utilization);
            }
        }
        self.shape.last().map_or(0, |p| p.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(points: &[(i64, i64)]) -> BrokenLinear {
        BrokenLinear::new(
            points
                .iter()
                .map(|&(utilization, score)| FunctionShapePoint { utilization, score })
                .collect(),
        )
    }

    fn assert_points(f: &BrokenLinear, expected: &[(i64, i64)]) {
        for &(p, want) in expected {
            assert_eq!(f.eval(p), want, "p={p}");
        }
    }

    #[test]
    fn broken_linear_rising_segment() {
        let f = shape(&[(10, 1), (90, 9)]);
        assert_points(&f, &[
            (-10, 1),
            (0, 1),
            (9, 1),
            (10, 1),
            (15, 1),
            (19, 1),
            (20, 2),
            (89, 8),
            (90, 9),
            (99, 9),
            (100, 9),
            (110, 9),
        ]);
    }

    #[test]
    fn broken_linear_rise_then_fall() {
        let f = shape(&[(0, 2), (40, 10), (100, 0)]);
        assert_points(&f, &[
            (-10, 2),
            (0, 2),
            (20, 6),
            (30, 8),
            (40, 10),
            (70, 5),
            (100, 0),
            (110, 0),
        ]);
    }

    #[test]
    fn broken_linear_flat() {
        let f = shape(&[(0, 2), (40, 2), (100, 2)]);
        assert_points(&f, &[(-10, 2), (0, 2), (30, 2), (70, 2), (110, 2)]);
    }

    #[test]
    fn host_of_ghost_is_error() {
        let ghost = NodeInfo::new();
        let status = host_of(&ghost).unwrap_err();
        assert_eq!(status.code(), fleetgrid_framework::Code::Error);
    }
}
