use serde::{Deserialize, Serialize};

/// Mean earth radius in meters, used by the flat-earth approximation.
const EARTH_RADIUS: f64 = 6_371_000.0;

/// Geodetic origin of the local Cartesian frame shared by all planning algorithms.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointGeo {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// A point in the local frame, `x` pointing east and `y` pointing north (meters).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub altitude: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lng: f64,
    pub alt: f64,
}

impl std::fmt::Display for Waypoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{};{};{}", self.lat, self.lng, self.alt)
    }
}

/* meters per degree of latitude, and of longitude at the latitude of the base */
fn scale(base: &PointGeo) -> (f64, f64) {
    let meters_per_degree = EARTH_RADIUS * std::f64::consts::PI / 180.0;
    (meters_per_degree, meters_per_degree * base.latitude.to_radians().cos())
}

/// Equirectangular conversion from the local frame to geodetic coordinates. Only valid
/// within a few kilometers of the base point.
pub fn to_geo(base: &PointGeo, x: f64, y: f64, altitude: f64) -> Waypoint {
    let (lat_scale, lng_scale) = scale(base);
    Waypoint {
        lat: base.latitude + y / lat_scale,
        lng: base.longitude + x / lng_scale,
        alt: altitude,
    }
}

pub fn to_local(base: &PointGeo, waypoint: &Waypoint) -> Position3D {
    let (lat_scale, lng_scale) = scale(base);
    Position3D {
        x: (waypoint.lng - base.longitude) * lng_scale,
        y: (waypoint.lat - base.latitude) * lat_scale,
        altitude: waypoint.alt,
    }
}

/// Converts an aviation heading (degrees, clockwise from north) into a mathematical
/// angle (degrees, counter-clockwise from east) in `[0, 360)`.
pub fn aviation_to_math(heading: f64) -> f64 {
    (90.0 - heading).rem_euclid(360.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: PointGeo = PointGeo { latitude: -22.0059, longitude: -47.8986, altitude: 870.0 };

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn round_trip() {
        for &(x, y, alt) in &[(0.0, 0.0, 0.0), (1500.0, -250.0, 30.0), (-3000.0, 4200.5, 12.25)] {
            let position = to_local(&BASE, &to_geo(&BASE, x, y, alt));
            assert!(close(position.x, x), "{} != {}", position.x, x);
            assert!(close(position.y, y), "{} != {}", position.y, y);
            assert!(close(position.altitude, alt));
        }
    }

    #[test]
    fn east_and_north_increase_longitude_and_latitude() {
        let origin = PointGeo { latitude: 0.0, longitude: 0.0, altitude: 0.0 };
        let east = to_geo(&origin, 100.0, 0.0, 10.0);
        let north = to_geo(&origin, 0.0, 100.0, 10.0);
        assert!(east.lng > 0.0 && east.lat == 0.0);
        assert!(north.lat > 0.0 && north.lng == 0.0);
        /* one degree is roughly 111 km at the equator */
        assert!(close(to_geo(&origin, 0.0, 111_194.93, 0.0).lat, 1.0));
    }

    #[test]
    fn heading_conversion() {
        assert_eq!(aviation_to_math(0.0), 90.0);
        assert_eq!(aviation_to_math(90.0), 0.0);
        assert_eq!(aviation_to_math(180.0), 270.0);
        assert_eq!(aviation_to_math(270.0), 180.0);
    }
}
