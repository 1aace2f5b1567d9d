use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::EARTH_RADIUS_M;

/// A WGS84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Finite and inside [-90, 90] x [-180, 180].
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}, {:.4}", self.latitude, self.longitude)
    }
}

/// A single fix from the location tracker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub coordinate: Coordinate,
    pub timestamp: DateTime<Utc>,
    /// Accuracy radius in metres, when the provider reports one.
    pub accuracy_m: Option<f64>,
}

impl PositionSample {
    pub fn new(coordinate: Coordinate, accuracy_m: Option<f64>) -> Self {
        Self {
            coordinate,
            timestamp: Utc::now(),
            accuracy_m,
        }
    }

    /// Age of the fix relative to `now`, clamped at zero for clock skew.
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.timestamp).num_milliseconds().max(0) as u64
    }
}

/// Great-circle distance in metres (haversine on a sphere of radius 6 371 km).
pub fn distance(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    // One metre of latitude in degrees on the haversine sphere.
    fn metres_to_lat_degrees(m: f64) -> f64 {
        (m / EARTH_RADIUS_M).to_degrees()
    }

    #[test]
    fn distance_to_self_is_zero() {
        for c in [
            Coordinate::new(12.9716, 77.5946),
            Coordinate::new(-89.9, 179.9),
            Coordinate::new(0.0, 0.0),
        ] {
            assert_eq!(distance(c, c), 0.0);
        }
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Coordinate::new(12.9716, 77.5946);
        let b = Coordinate::new(28.6139, 77.2090);
        assert!((distance(a, b) - distance(b, a)).abs() < 1e-6);
    }

    #[test]
    fn thirty_metres_north() {
        let a = Coordinate::new(12.9716, 77.5946);
        let b = Coordinate::new(a.latitude + metres_to_lat_degrees(30.0), a.longitude);
        assert!((distance(a, b) - 30.0).abs() < 0.01);
    }

    #[test]
    fn short_diagonal_hop() {
        let d = distance(Coordinate::new(12.9716, 77.5946), Coordinate::new(12.9717, 77.5947));
        assert!(d > 14.0 && d < 16.0, "got {d}");
    }

    #[test]
    fn validity_bounds() {
        assert!(Coordinate::new(90.0, -180.0).is_valid());
        assert!(!Coordinate::new(90.1, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn display_uses_four_decimals() {
        assert_eq!(Coordinate::new(12.9716, 77.5946).to_string(), "12.9716, 77.5946");
    }
}
