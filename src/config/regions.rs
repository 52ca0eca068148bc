//! Fixed region set and nearest-region selection.
//!
//! Targets are sharded across a finite set of deployment regions. A target
//! with known coordinates is assigned to the region whose centroid is the
//! nearest by great-circle distance; targets without geo data stay in the
//! canonical region.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Deployment region codes. The set is fixed; codes are stable identifiers
/// persisted on target documents and used as lock-document keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "us-central")]
    UsCentral,
    #[serde(rename = "us-east")]
    UsEast,
    #[serde(rename = "us-west")]
    UsWest,
    #[serde(rename = "eu-west")]
    EuWest,
    #[serde(rename = "eu-central")]
    EuCentral,
    #[serde(rename = "ap-south")]
    ApSouth,
    #[serde(rename = "ap-southeast")]
    ApSoutheast,
    #[serde(rename = "ap-northeast")]
    ApNortheast,
    #[serde(rename = "sa-east")]
    SaEast,
    #[serde(rename = "au-southeast")]
    AuSoutheast,
}

/// Region centroids used for nearest-region computation.
/// Coordinates approximate the hosting locations, not the legal regions.
const CENTROIDS: &[(Region, f64, f64)] = &[
    (Region::UsCentral, 41.26, -95.86),
    (Region::UsEast, 39.04, -77.49),
    (Region::UsWest, 45.60, -121.18),
    (Region::EuWest, 53.35, -6.26),
    (Region::EuCentral, 50.11, 8.68),
    (Region::ApSouth, 19.08, 72.88),
    (Region::ApSoutheast, 1.35, 103.82),
    (Region::ApNortheast, 35.68, 139.69),
    (Region::SaEast, -23.55, -46.63),
    (Region::AuSoutheast, -33.87, 151.21),
];

impl Region {
    /// All regions, in centroid-table order.
    pub fn all() -> impl Iterator<Item = Region> {
        CENTROIDS.iter().map(|(r, _, _)| *r)
    }

    /// The canonical region: owns targets with no region assignment and is
    /// the fallback when geo data is unknown.
    pub fn canonical() -> Region {
        Region::UsCentral
    }

    /// Stable string code for this region.
    pub fn code(&self) -> &'static str {
        match self {
            Region::UsCentral => "us-central",
            Region::UsEast => "us-east",
            Region::UsWest => "us-west",
            Region::EuWest => "eu-west",
            Region::EuCentral => "eu-central",
            Region::ApSouth => "ap-south",
            Region::ApSoutheast => "ap-southeast",
            Region::ApNortheast => "ap-northeast",
            Region::SaEast => "sa-east",
            Region::AuSoutheast => "au-southeast",
        }
    }

    /// Nearest region by haversine distance to the given coordinates.
    pub fn nearest(lat: f64, lon: f64) -> Region {
        let mut best = Region::canonical();
        let mut best_km = f64::INFINITY;
        for (region, clat, clon) in CENTROIDS {
            let d = haversine_km(lat, lon, *clat, *clon);
            if d < best_km {
                best_km = d;
                best = *region;
            }
        }
        best
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = UnknownRegion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::all()
            .find(|r| r.code() == s)
            .ok_or_else(|| UnknownRegion(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown region code: {0}")]
pub struct UnknownRegion(pub String);

/// Great-circle distance between two coordinates in kilometers.
fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}
