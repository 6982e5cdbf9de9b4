use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metres per degree of great-circle arc, from the ArduPilot autotest tooling.
const DEG_TO_M: f64 = 1.113195e5;

/// Spherical-earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// A geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub alt_m: Option<f64>,
}

impl GeoPosition {
    pub fn new(lat_deg: f64, lon_deg: f64) -> Self {
        Self { lat_deg, lon_deg, alt_m: None }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum GeoError {
    /// cos(lat) vanishes at the poles, so an east offset has no longitude
    /// equivalent there.
    #[error("destination offset undefined at latitude {lat_deg}")]
    PoleOffset { lat_deg: f64 },
}

/// Ground distance in metres between two positions.
///
/// Planar approximation over the degree-space hypotenuse. Fine for short
/// baselines; degrades over long distances and close to the earth's poles.
pub fn distance_m(a: GeoPosition, b: GeoPosition) -> f64 {
    let dlat = b.lat_deg - a.lat_deg;
    let dlon = b.lon_deg - a.lon_deg;
    (dlat * dlat + dlon * dlon).sqrt() * DEG_TO_M
}

/// Bearing in degrees from `a` to `b`, in [0, 360).
///
/// Same approximation caveats as [`distance_m`]. Coincident points yield 90
/// (atan2(0, 0) is 0).
pub fn bearing_deg(a: GeoPosition, b: GeoPosition) -> f64 {
    let off_x = b.lon_deg - a.lon_deg;
    let off_y = b.lat_deg - a.lat_deg;
    let mut bearing = 90.0 + (-off_y).atan2(off_x).to_degrees();
    if bearing < 0.0 {
        bearing += 360.0;
    }
    bearing
}

/// Angular offsets `(d_lat_rad, d_lon_rad)` corresponding to a displacement
/// of `d_north_m` / `d_east_m` metres from `origin`, on a spherical earth.
///
/// Returns only the offsets; callers add them back to an origin themselves.
pub fn destination_offset(
    origin: GeoPosition,
    d_north_m: f64,
    d_east_m: f64,
) -> Result<(f64, f64), GeoError> {
    // cos(90deg.to_radians()) is ~6e-17 rather than zero in f64, so the pole
    // case is caught on the latitude itself.
    if origin.lat_deg.abs() >= 90.0 {
        return Err(GeoError::PoleOffset { lat_deg: origin.lat_deg });
    }
    let d_lat = d_north_m / EARTH_RADIUS_M;
    let d_lon = d_east_m / (EARTH_RADIUS_M * (std::f64::consts::PI * origin.lat_deg / 180.0).cos());
    Ok((d_lat, d_lon))
}
