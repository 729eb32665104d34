// Shared great-circle distance helper. Coordinates cross every component
// boundary as signed integers at scale 1e7 (spec §3/§6); this is the single
// place that converts to floating-point degrees and back out to metres.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn e7_to_degrees(v: i64) -> f64 {
    v as f64 / 1e7
}

pub fn degrees_to_e7(v: f64) -> i64 {
    (v * 1e7).round() as i64
}

/// Haversine distance in metres between two points given in degrees.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (lat1, lng1, lat2, lng2) = (
        lat1.to_radians(),
        lng1.to_radians(),
        lat2.to_radians(),
        lng2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

/// Haversine distance in metres between two e7-scaled coordinate pairs.
pub fn haversine_m_e7(lat1: i64, lng1: i64, lat2: i64, lng2: i64) -> f64 {
    haversine_m(
        e7_to_degrees(lat1),
        e7_to_degrees(lng1),
        e7_to_degrees(lat2),
        e7_to_degrees(lng2),
    )
}
