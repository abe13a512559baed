// =============================================================================
// City registry — model routing and grid-bounds selection
// =============================================================================
//
// City -> model routing is configuration: CONUS cities prefer HRRR, non-CONUS
// cities prefer GFS/ECMWF. For each publication only cities inside the
// model's grid envelope are extracted; cities outside are skipped silently
// (debug log only — this is the dominant source of "missing" cities in
// regional models, never an error).
//
// The HRRR/RAP envelopes are rectangular approximations of Lambert Conformal
// grids; good enough as a pre-filter, not a correctness gate.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Coord, ModelKind};

/// A tracked city.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct City {
    pub id: String,
    pub name: String,
    pub coord: Coord,
    /// Preferred model for this city's forecasts.
    pub preferred_model: ModelKind,
}

/// Rectangular grid envelope for a model.
#[derive(Debug, Clone, Copy)]
struct GridBounds {
    lat_min: f64,
    lat_max: f64,
    lon_min: f64,
    lon_max: f64,
}

impl GridBounds {
    fn contains(&self, coord: Coord) -> bool {
        (self.lat_min..=self.lat_max).contains(&coord.lat)
            && (self.lon_min..=self.lon_max).contains(&coord.lon)
    }
}

fn bounds_for(model: ModelKind) -> Option<GridBounds> {
    match model {
        ModelKind::Hrrr => Some(GridBounds {
            lat_min: 21.0,
            lat_max: 53.0,
            lon_min: -134.0,
            lon_max: -60.0,
        }),
        // RAP covers a slightly wider North American domain.
        ModelKind::Rap => Some(GridBounds {
            lat_min: 16.0,
            lat_max: 58.0,
            lon_min: -140.0,
            lon_max: -57.0,
        }),
        // Global models.
        ModelKind::Gfs | ModelKind::Ecmwf => None,
    }
}

/// Whether a coordinate falls inside a model's grid.
pub fn in_grid_bounds(model: ModelKind, coord: Coord) -> bool {
    match bounds_for(model) {
        Some(b) => b.contains(coord),
        None => true,
    }
}

/// Owns the configured city list in deterministic order.
#[derive(Debug, Clone)]
pub struct CityRegistry {
    cities: Vec<City>,
}

impl CityRegistry {
    pub fn new(cities: Vec<City>) -> Self {
        Self { cities }
    }

    /// Default tracked cities.
    pub fn builtin() -> Self {
        fn city(id: &str, name: &str, lat: f64, lon: f64, model: ModelKind) -> City {
            City {
                id: id.to_string(),
                name: name.to_string(),
                coord: Coord { lat, lon },
                preferred_model: model,
            }
        }
        Self::new(vec![
            city("nyc", "New York", 40.7128, -74.0060, ModelKind::Hrrr),
            city("chi", "Chicago", 41.8781, -87.6298, ModelKind::Hrrr),
            city("mia", "Miami", 25.7617, -80.1918, ModelKind::Hrrr),
            city("den", "Denver", 39.7392, -104.9903, ModelKind::Hrrr),
            city("aus", "Austin", 30.2672, -97.7431, ModelKind::Hrrr),
            city("sea", "Seattle", 47.6062, -122.3321, ModelKind::Hrrr),
            city("phl", "Philadelphia", 39.9526, -75.1652, ModelKind::Hrrr),
            city("lon", "London", 51.5074, -0.1278, ModelKind::Ecmwf),
            city("par", "Paris", 48.8566, 2.3522, ModelKind::Ecmwf),
        ])
    }

    pub fn all(&self) -> &[City] {
        &self.cities
    }

    pub fn get(&self, id: &str) -> Option<&City> {
        self.cities.iter().find(|c| c.id == id)
    }

    /// Coordinates of every tracked city, in registry order.
    pub fn coords(&self) -> Vec<Coord> {
        self.cities.iter().map(|c| c.coord).collect()
    }

    /// Cities to extract from a publication of `model`: inside the model's
    /// grid bounds, in registry order. Out-of-bounds cities are skipped at
    /// debug level.
    pub fn cities_for_model(&self, model: ModelKind) -> Vec<&City> {
        self.cities
            .iter()
            .filter(|c| {
                let inside = in_grid_bounds(model, c.coord);
                if !inside {
                    debug!(city = %c.id, model = %model, "city outside model grid — skipped");
                }
                inside
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conus_cities_fall_inside_hrrr_envelope() {
        let reg = CityRegistry::builtin();
        let hrrr = reg.cities_for_model(ModelKind::Hrrr);
        let ids: Vec<&str> = hrrr.iter().map(|c| c.id.as_str()).collect();
        assert!(ids.contains(&"nyc"));
        assert!(ids.contains(&"sea"));
        assert!(!ids.contains(&"lon"));
        assert!(!ids.contains(&"par"));
    }

    #[test]
    fn global_models_take_every_city() {
        let reg = CityRegistry::builtin();
        assert_eq!(reg.cities_for_model(ModelKind::Gfs).len(), reg.all().len());
        assert_eq!(
            reg.cities_for_model(ModelKind::Ecmwf).len(),
            reg.all().len()
        );
    }

    #[test]
    fn bounds_check_is_exclusive_of_far_coordinates() {
        assert!(in_grid_bounds(
            ModelKind::Hrrr,
            Coord {
                lat: 40.0,
                lon: -100.0
            }
        ));
        assert!(!in_grid_bounds(
            ModelKind::Hrrr,
            Coord {
                lat: 51.5,
                lon: -0.12
            }
        ));
    }
}
