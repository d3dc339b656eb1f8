//! WGS-84 geometry used by the odometer and the geofence rules.

use crate::domain::GeofenceGeometry;

/// Mean earth radius, km (IUGG).
const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Great-circle distance between two points, km.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    haversine_km(lat1, lon1, lat2, lon2) * 1000.0
}

/// Point membership for a geofence: containment for polygons, corridor
/// distance for polylines.
pub fn contains(geometry: &GeofenceGeometry, lat: f64, lon: f64) -> bool {
    match geometry {
        GeofenceGeometry::Polygon { ring } => point_in_ring(ring, lat, lon),
        GeofenceGeometry::Polyline { points, corridor_m } => {
            distance_to_polyline_m(points, lat, lon)
                .map(|d| d <= *corridor_m)
                .unwrap_or(false)
        }
    }
}

/// Ray casting over the ring's (lat, lon) vertices. The closing edge is
/// implicit, so an explicitly closed ring works too.
fn point_in_ring(ring: &[(f64, f64)], lat: f64, lon: f64) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (lat_i, lon_i) = ring[i];
        let (lat_j, lon_j) = ring[j];
        if ((lon_i > lon) != (lon_j > lon))
            && (lat < (lat_j - lat_i) * (lon - lon_i) / (lon_j - lon_i) + lat_i)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Minimum distance from the point to any polyline segment, metres.
/// Segments are short enough in practice that a local equirectangular
/// projection around the point is accurate to well under the corridor.
fn distance_to_polyline_m(points: &[(f64, f64)], lat: f64, lon: f64) -> Option<f64> {
    if points.is_empty() {
        return None;
    }
    if points.len() == 1 {
        return Some(distance_m(lat, lon, points[0].0, points[0].1));
    }
    let cos_lat = lat.to_radians().cos();
    let project = |p_lat: f64, p_lon: f64| -> (f64, f64) {
        let x = (p_lon - lon).to_radians() * cos_lat * EARTH_RADIUS_KM * 1000.0;
        let y = (p_lat - lat).to_radians() * EARTH_RADIUS_KM * 1000.0;
        (x, y)
    };

    let mut best = f64::INFINITY;
    for segment in points.windows(2) {
        let (x1, y1) = project(segment[0].0, segment[0].1);
        let (x2, y2) = project(segment[1].0, segment[1].1);
        let dx = x2 - x1;
        let dy = y2 - y1;
        let len_sq = dx * dx + dy * dy;
        let t = if len_sq == 0.0 {
            0.0
        } else {
            ((-x1 * dx - y1 * dy) / len_sq).clamp(0.0, 1.0)
        };
        let px = x1 + t * dx;
        let py = y1 + t * dy;
        best = best.min((px * px + py * py).sqrt());
    }
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // Paris -> London, roughly 344 km.
        let d = haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 344.0).abs() < 2.0, "got {d}");
    }

    #[test]
    fn haversine_zero_for_same_point() {
        assert_eq!(haversine_km(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    #[test]
    fn unit_square_polygon_membership() {
        let square = GeofenceGeometry::Polygon {
            ring: vec![(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)],
        };
        assert!(contains(&square, 0.5, 0.5));
        assert!(!contains(&square, 2.0, 2.0));
        assert!(!contains(&square, -0.1, 0.5));
    }

    #[test]
    fn degenerate_ring_contains_nothing() {
        let line = GeofenceGeometry::Polygon { ring: vec![(0.0, 0.0), (1.0, 1.0)] };
        assert!(!contains(&line, 0.5, 0.5));
    }

    #[test]
    fn polyline_corridor_membership() {
        // Segment along the equator, ~111 m corridor.
        let route = GeofenceGeometry::Polyline {
            points: vec![(0.0, 0.0), (0.0, 0.01)],
            corridor_m: 120.0,
        };
        // ~55 m north of the line midpoint.
        assert!(contains(&route, 0.0005, 0.005));
        // ~555 m north, outside.
        assert!(!contains(&route, 0.005, 0.005));
        // Beyond the endpoint by far.
        assert!(!contains(&route, 0.0, 0.02));
    }

    #[test]
    fn distance_m_scales_km() {
        let km = haversine_km(0.0, 0.0, 0.0, 0.001);
        assert!((distance_m(0.0, 0.0, 0.0, 0.001) - km * 1000.0).abs() < 1e-9);
    }
}
