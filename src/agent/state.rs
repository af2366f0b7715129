// state.rs - Exploration trajectory records

use serde::{Deserialize, Serialize};

use crate::error::{GenexError, Result};

/// What the agent sensed after a step
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Range per sensor ray, evenly spaced over 360 degrees starting at +z
    pub ranges: Vec<f32>,
    /// Cells seen for the first time on this step
    pub newly_observed: usize,
    /// Cells seen so far
    pub observed: usize,
    /// Fraction of reachable walkable cells seen so far
    pub coverage: f32,
}

/// One imagined rollout along a candidate heading
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImaginedState {
    pub heading: f32,
    pub position: [f32; 3],
    /// Unseen cells the sensor is expected to reveal at `position`
    pub predicted_gain: usize,
    /// Rollout stopped early on believed-unwalkable ground
    pub blocked: bool,
}

/// A step of the trajectory. Orientation is a unit quaternion `[x, y, z, w]`
/// and confidence lies in [0, 1]; both are enforced on construction and
/// deserialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "StateRecord")]
pub struct ExplorationState {
    pub position: [f32; 3],
    pub orientation: [f32; 4],
    pub observations: Observation,
    pub imagined_states: Vec<ImaginedState>,
    pub confidence: f32,
}

#[derive(Deserialize)]
struct StateRecord {
    position: [f32; 3],
    orientation: [f32; 4],
    #[serde(default)]
    observations: Observation,
    #[serde(default)]
    imagined_states: Vec<ImaginedState>,
    #[serde(default)]
    confidence: f32,
}

impl From<StateRecord> for ExplorationState {
    fn from(r: StateRecord) -> Self {
        ExplorationState::new(r.position, r.orientation, r.observations, r.imagined_states, r.confidence)
    }
}

impl ExplorationState {
    pub fn new(
        position: [f32; 3],
        orientation: [f32; 4],
        observations: Observation,
        imagined_states: Vec<ImaginedState>,
        confidence: f32,
    ) -> Self {
        Self {
            position,
            orientation: normalize_quaternion(orientation),
            observations,
            imagined_states,
            confidence: if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 },
        }
    }

    /// Heading about +y, zero looking along +z
    pub fn yaw(&self) -> f32 {
        let [x, y, z, w] = self.orientation;
        (2.0 * (w * y + x * z)).atan2(1.0 - 2.0 * (x * x + y * y))
    }
}

/// Rotation of `yaw` radians about +y
pub fn yaw_quaternion(yaw: f32) -> [f32; 4] {
    let (s, c) = (yaw * 0.5).sin_cos();
    [0.0, s, 0.0, c]
}

/// Unit quaternion; degenerate input becomes the identity. Input already of
/// unit length is returned unchanged so repeated normalization is stable.
pub fn normalize_quaternion(q: [f32; 4]) -> [f32; 4] {
    let n = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    if !n.is_finite() || n < 1e-8 {
        return [0.0, 0.0, 0.0, 1.0];
    }
    if (n - 1.0).abs() < 1e-6 {
        return q;
    }
    [q[0] / n, q[1] / n, q[2] / n, q[3] / n]
}

/// Target to reach during exploration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub position: [f32; 3],
    /// Horizontal distance that counts as arrived; agent default when absent
    #[serde(default)]
    pub tolerance: Option<f32>,
}

impl Goal {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let goal: Goal = serde_json::from_value(value.clone()).map_err(|e| GenexError::InvalidGoal(e.to_string()))?;
        if goal.position.iter().any(|v| !v.is_finite()) {
            return Err(GenexError::InvalidGoal("position must be finite".into()));
        }
        if goal.tolerance.is_some_and(|t| !t.is_finite() || t <= 0.0) {
            return Err(GenexError::InvalidGoal("tolerance must be positive".into()));
        }
        Ok(goal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_normalizes_and_clamps() {
        let s = ExplorationState::new([0.0; 3], [0.0, 2.0, 0.0, 0.0], Observation::default(), vec![], 3.0);
        assert_eq!(s.orientation, [0.0, 1.0, 0.0, 0.0]);
        assert_eq!(s.confidence, 1.0);

        let s = ExplorationState::new([0.0; 3], [0.0; 4], Observation::default(), vec![], f32::NAN);
        assert_eq!(s.orientation, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(s.confidence, 0.0);
    }

    #[test]
    fn deserialization_enforces_invariants() {
        let json = r#"{"position":[1.0,0.0,2.0],"orientation":[0.0,0.0,0.0,4.0],"confidence":-2.0}"#;
        let s: ExplorationState = serde_json::from_str(json).unwrap();
        assert_eq!(s.orientation, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(s.confidence, 0.0);
        assert!(s.imagined_states.is_empty());
    }

    #[test]
    fn yaw_survives_quaternion_round_trip() {
        for yaw in [-2.5f32, -0.3, 0.0, 1.1, 3.0] {
            let s = ExplorationState::new([0.0; 3], yaw_quaternion(yaw), Observation::default(), vec![], 0.5);
            assert!((s.yaw() - yaw).abs() < 1e-5, "{yaw} vs {}", s.yaw());
        }
    }

    #[test]
    fn goal_validation() {
        let ok = Goal::from_value(&serde_json::json!({"position": [1.0, 0.0, 2.0]})).unwrap();
        assert_eq!(ok.tolerance, None);
        assert!(Goal::from_value(&serde_json::json!({"target": "kitchen"})).is_err());
        assert!(Goal::from_value(&serde_json::json!({"position": [0.0, 0.0, 0.0], "tolerance": -1.0})).is_err());
    }
}
