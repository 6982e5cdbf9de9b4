use serde::{Deserialize, Serialize};

/// A raw local-frame sample as recorded by a mission source. `z_m` is up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalPosition {
    pub x_m: f64,
    pub y_m: f64,
    pub z_m: f64,
}

impl From<[f64; 3]> for LocalPosition {
    fn from([x_m, y_m, z_m]: [f64; 3]) -> Self {
        Self { x_m, y_m, z_m }
    }
}

/// A displacement in the local North-East-Down frame. `down_m` is positive
/// toward the earth's center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NedVector {
    pub north_m: f64,
    pub east_m: f64,
    pub down_m: f64,
}

/// Which trailing samples never start a conversion step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowPolicy {
    /// The last two input positions never start a step; output length is
    /// max(0, n-2). This matches the recorded-trajectory pipelines this tool
    /// replaces, so it is the default even though it drops one real
    /// transition.
    DropLastTwo,
    /// Plain adjacent-pair differencing; output length is max(0, n-1).
    DropLastOne,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    pub window: WindowPolicy,
    /// Unit conversion applied to every component of every step.
    pub scale: f64,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self { window: WindowPolicy::DropLastTwo, scale: 100.0 }
    }
}

/// Converts an ordered list of local samples into the NED displacement
/// between consecutive samples, negating the vertical axis (up -> down) and
/// applying the configured scale. Output ordering follows input ordering;
/// inputs shorter than the window yield an empty trajectory.
pub fn to_ned_sequence(samples: &[LocalPosition], cfg: &TrajectoryConfig) -> Vec<NedVector> {
    let steps = match cfg.window {
        WindowPolicy::DropLastTwo => samples.len().saturating_sub(2),
        WindowPolicy::DropLastOne => samples.len().saturating_sub(1),
    };
    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        let (a, b) = (samples[i], samples[i + 1]);
        out.push(NedVector {
            north_m: (b.x_m - a.x_m) * cfg.scale,
            east_m: (b.y_m - a.y_m) * cfg.scale,
            down_m: -(b.z_m - a.z_m) * cfg.scale,
        });
    }
    out
}
