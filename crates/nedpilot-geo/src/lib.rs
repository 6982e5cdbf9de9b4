pub mod geodesy;
pub mod trajectory;

pub use geodesy::{bearing_deg, destination_offset, distance_m, GeoError, GeoPosition};
pub use trajectory::{to_ned_sequence, LocalPosition, NedVector, TrajectoryConfig, WindowPolicy};
