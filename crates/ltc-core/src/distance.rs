//! Great-circle distance and approximate city coordinates for radius filters.

use crate::FacilityRecord;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Downtown Toronto, the default reference point for radius filters.
pub const DOWNTOWN_TORONTO: (f64, f64) = (43.6532, -79.3832);

const CITY_COORDINATES: &[(&str, (f64, f64))] = &[
    ("TORONTO", (43.6532, -79.3832)),
    ("SCARBOROUGH", (43.7732, -79.2578)),
    ("ETOBICOKE", (43.6205, -79.5132)),
    ("NORTH YORK", (43.7615, -79.4111)),
    ("MISSISSAUGA", (43.5890, -79.6441)),
    ("BRAMPTON", (43.7315, -79.7624)),
    ("MARKHAM", (43.8561, -79.3370)),
    ("VAUGHAN", (43.8361, -79.4982)),
    ("RICHMOND HILL", (43.8828, -79.4403)),
    ("OAKVILLE", (43.4675, -79.6877)),
    ("BURLINGTON", (43.3255, -79.7990)),
    ("PICKERING", (43.8384, -79.0868)),
    ("AJAX", (43.8509, -79.0204)),
    ("WHITBY", (43.8975, -78.9429)),
    ("OSHAWA", (43.8971, -78.8658)),
    ("MILTON", (43.5183, -79.8774)),
    ("NEWMARKET", (44.0592, -79.4613)),
    ("AURORA", (43.9995, -79.4504)),
    ("KING CITY", (43.9228, -79.5292)),
    ("STOUFFVILLE", (43.9706, -79.2447)),
    ("CALEDON", (43.8672, -79.8608)),
    ("GEORGINA", (44.2991, -79.4347)),
    ("UXBRIDGE", (44.1089, -79.1206)),
    ("HAMILTON", (43.2557, -79.8711)),
    ("ORANGEVILLE", (43.9197, -80.0943)),
    ("GEORGETOWN", (43.6458, -79.9222)),
    ("WOODBRIDGE", (43.7828, -79.5986)),
    ("CONCORD", (43.7970, -79.4872)),
    ("THORNHILL", (43.8089, -79.4214)),
];

/// Haversine distance in kilometres.
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let d_lat = (b.0 - a.0).to_radians();
    let d_lon = (b.1 - a.1).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.0.to_radians().cos() * b.0.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

pub fn city_coordinates(city: &str) -> Option<(f64, f64)> {
    let key = crate::normalize_name(city);
    CITY_COORDINATES
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, coords)| *coords)
}

/// Homes whose city lies within `radius_km` of `center`. Provincial rows and
/// homes in cities without known coordinates are excluded.
pub fn within_radius<'a>(
    homes: &'a [FacilityRecord],
    center: (f64, f64),
    radius_km: f64,
) -> Vec<&'a FacilityRecord> {
    homes
        .iter()
        .filter(|home| !home.is_provincial)
        .filter(|home| {
            home.details
                .city
                .as_deref()
                .and_then(city_coordinates)
                .is_some_and(|coords| haversine_km(center, coords) <= radius_km)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LocationDetails, QualityMetrics};

    fn home(name: &str, city: Option<&str>, is_provincial: bool) -> FacilityRecord {
        FacilityRecord {
            name: name.into(),
            details: LocationDetails {
                city: city.map(ToString::to_string),
                ..Default::default()
            },
            metrics: QualityMetrics::default(),
            region: None,
            is_provincial,
        }
    }

    #[test]
    fn haversine_is_zero_for_same_point_and_symmetric() {
        assert!(haversine_km(DOWNTOWN_TORONTO, DOWNTOWN_TORONTO).abs() < 1e-9);
        let hamilton = city_coordinates("Hamilton").unwrap();
        let a = haversine_km(DOWNTOWN_TORONTO, hamilton);
        let b = haversine_km(hamilton, DOWNTOWN_TORONTO);
        assert!((a - b).abs() < 1e-9);
        assert!(a > 50.0 && a < 65.0, "toronto-hamilton was {a}");
    }

    #[test]
    fn city_lookup_is_case_insensitive() {
        assert_eq!(city_coordinates(" north york "), city_coordinates("NORTH YORK"));
        assert!(city_coordinates("Atlantis").is_none());
    }

    #[test]
    fn radius_filter_skips_provincial_and_unknown_cities() {
        let homes = vec![
            home("A", Some("Toronto"), false),
            home("B", Some("Hamilton"), false),
            home("C", Some("Nowhere"), false),
            home("D", None, false),
            home("Ontario Provincial Average", Some("Toronto"), true),
        ];
        let names: Vec<_> = within_radius(&homes, DOWNTOWN_TORONTO, 40.0)
            .into_iter()
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(names, vec!["A"]);
    }
}
