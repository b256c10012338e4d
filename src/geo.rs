//! Great-circle helpers for location bucketing.

use crate::model::LocationBucket;

/// Raw coordinates closer than this to an existing bucket reuse it.
pub const BUCKET_RADIUS_M: f64 = 50.0;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters.
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

pub fn valid_coordinates(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// The closest bucket within `BUCKET_RADIUS_M` of the point, if any.
pub fn nearest_within_radius<'a, I>(buckets: I, lat: f64, lon: f64) -> Option<&'a LocationBucket>
where
    I: IntoIterator<Item = &'a LocationBucket>,
{
    buckets
        .into_iter()
        .map(|b| (b, distance_m(lat, lon, b.latitude, b.longitude)))
        .filter(|(_, d)| *d <= BUCKET_RADIUS_M)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(b, _)| b)
}

/// Name used when the caller does not suggest one.
pub fn generated_area_name(lat: f64, lon: f64) -> String {
    format!("Location {lat:.4},{lon:.4}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn bucket(lat: f64, lon: f64) -> LocationBucket {
        LocationBucket {
            id: Ulid::new(),
            area_name: generated_area_name(lat, lon),
            latitude: lat,
            longitude: lon,
        }
    }

    #[test]
    fn zero_distance_to_self() {
        assert!(distance_m(23.7806, 90.4070, 23.7806, 90.4070) < 1e-6);
    }

    #[test]
    fn one_degree_latitude_is_about_111km() {
        let d = distance_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 50.0, "got {d}");
    }

    #[test]
    fn nearest_picks_closest_inside_radius() {
        // ~0.0001 deg lat ≈ 11 m, ~0.0003 deg ≈ 33 m
        let far = bucket(23.7806, 90.4100);
        let mid = bucket(23.7809, 90.4070);
        let near = bucket(23.7807, 90.4070);
        let buckets = vec![far, mid, near.clone()];

        let hit = nearest_within_radius(&buckets, 23.7806, 90.4070).unwrap();
        assert_eq!(hit.id, near.id);
    }

    #[test]
    fn nothing_within_radius() {
        // ~0.001 deg lat ≈ 111 m
        let buckets = vec![bucket(23.7816, 90.4070)];
        assert!(nearest_within_radius(&buckets, 23.7806, 90.4070).is_none());
    }

    #[test]
    fn generated_name_rounds_to_four_places() {
        assert_eq!(generated_area_name(23.780_649, 90.407_049), "Location 23.7806,90.4070");
    }

    #[test]
    fn coordinate_bounds() {
        assert!(valid_coordinates(-90.0, 180.0));
        assert!(!valid_coordinates(90.5, 0.0));
        assert!(!valid_coordinates(0.0, f64::NAN));
    }
}
