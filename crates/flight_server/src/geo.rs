//! Great-circle distance helpers.

use serde::{Deserialize, Serialize};

/// Mean earth radius in nautical miles.
pub const EARTH_RADIUS_NM: f64 = 3440.065;

/// A point on the earth's surface with an optional altitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in decimal degrees
    pub lat: f64,
    /// Longitude in decimal degrees
    pub lon: f64,
    /// Altitude in feet (ignored for distance)
    #[serde(default)]
    pub alt_ft: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon, alt_ft: 0.0 }
    }

    pub fn with_altitude(mut self, alt_ft: f64) -> Self {
        self.alt_ft = alt_ft;
        self
    }

    /// Haversine distance to `other` in nautical miles.
    pub fn distance_nm(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.lon - self.lon).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_NM * a.sqrt().min(1.0).asin()
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}
