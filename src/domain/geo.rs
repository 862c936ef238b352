//! Coordinates and the proximity filter.
//!
//! Candidate search is a linear haversine scan over open requests. That is fine at
//! the scale this system runs at; storage backends may narrow the scan first (the
//! PostgreSQL backend uses a latitude band from [`latitude_band`]) but the exact
//! distance check always happens here.

use serde::{Deserialize, Serialize};

use crate::domain::actor::UserId;
use crate::domain::request::{EmergencyRequest, RequestStatus};
use crate::error::{Result, TowlineError};

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Default search radius for candidate queries.
pub const DEFAULT_RADIUS_KM: f64 = 10.0;

/// Decimal places kept for stored coordinates (a `DECIMAL(9,6)` column).
const COORDINATE_SCALE: f64 = 1_000_000.0;

/// A validated latitude/longitude pair in decimal degrees.
///
/// Deserialization goes through [`Coordinates::new`], so out-of-range input is
/// rejected on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinates")]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct RawCoordinates {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawCoordinates> for Coordinates {
    type Error = TowlineError;

    fn try_from(raw: RawCoordinates) -> Result<Self> {
        Coordinates::new(raw.latitude, raw.longitude)
    }
}

impl Coordinates {
    /// Validate and round to six fractional digits.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(TowlineError::InvalidCoordinates(
                "Coordinates must be valid numbers".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(TowlineError::InvalidCoordinates(format!(
                "Latitude must be between -90 and 90, got {}",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(TowlineError::InvalidCoordinates(format!(
                "Longitude must be between -180 and 180, got {}",
                longitude
            )));
        }

        Ok(Self {
            latitude: (latitude * COORDINATE_SCALE).round() / COORDINATE_SCALE,
            longitude: (longitude * COORDINATE_SCALE).round() / COORDINATE_SCALE,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle distance to `other` in kilometres.
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        haversine_km(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Great-circle distance between two points given in decimal degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // Clamp guards asin against a hair above 1.0 from rounding on antipodal points
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

pub fn validate_radius(radius_km: f64) -> Result<f64> {
    if radius_km.is_finite() && radius_km > 0.0 {
        Ok(radius_km)
    } else {
        Err(TowlineError::Validation(format!(
            "Search radius must be a positive number of kilometres, got {}",
            radius_km
        )))
    }
}

/// Latitude range that can contain any point within `radius_km` of `origin`.
///
/// Longitude is not bounded. Callers still apply the exact haversine check.
pub fn latitude_band(origin: &Coordinates, radius_km: f64) -> (f64, f64) {
    let delta = (radius_km / EARTH_RADIUS_KM).to_degrees();
    (
        (origin.latitude - delta).max(-90.0),
        (origin.latitude + delta).min(90.0),
    )
}

/// Narrow `requests` to pending ones within `radius_km` of `origin` that
/// `excluding_service` has not declined.
///
/// Output is ordered by `(created_at, id)` so repeated queries page consistently.
pub fn filter_candidates<I>(
    origin: &Coordinates,
    radius_km: f64,
    excluding_service: UserId,
    requests: I,
) -> Vec<EmergencyRequest>
where
    I: IntoIterator<Item = EmergencyRequest>,
{
    let mut candidates: Vec<EmergencyRequest> = requests
        .into_iter()
        .filter(|r| r.status == RequestStatus::Pending)
        .filter(|r| !r.is_declined_by(excluding_service))
        .filter(|r| origin.distance_km(&r.location) <= radius_km)
        .collect();
    candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    candidates
}
