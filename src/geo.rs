//! Geospatial cell index for the hyperlocal feed
//!
//! Maps coordinates onto a deterministic geohash grid. Cells are the unit
//! of subscription, aggregation, and backlog retention: an event belongs
//! to exactly one cell, and a session covers the set of cells within its
//! radius.
//!
//! Precision guide (cell edge, approximate):
//! - 5: ~3.1 mi — city district
//! - 6: ~0.75 mi — neighborhood (default)
//! - 7: ~0.1 mi — block
//!
//! Resolution is fixed per deployment so cell ids stay stable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::GeoError;

/// Geohash base-32 alphabet (no a/i/l/o).
const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Earth's radius in miles, for haversine distances.
const EARTH_RADIUS_MILES: f64 = 3959.0;

/// Degrees of latitude per mile.
const LAT_DEGREES_PER_MILE: f64 = 1.0 / 69.0;

/// Opaque identifier for a bounded geographic area.
///
/// A geohash string at a fixed precision. Deterministic function of
/// (lat, lng, precision): the same coordinate always yields the same cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cell(String);

impl Cell {
    /// Wrap an existing geohash string.
    ///
    /// Rejects strings that are empty, too long, or contain characters
    /// outside the geohash alphabet.
    pub fn parse(s: &str) -> Result<Self, GeoError> {
        if s.is_empty() || s.len() > 12 {
            return Err(GeoError::InvalidCell(s.to_string()));
        }
        if !s.bytes().all(|b| BASE32.contains(&b)) {
            return Err(GeoError::InvalidCell(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The cell id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Geohash precision (number of characters).
    pub fn precision(&self) -> u8 {
        self.0.len() as u8
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate a coordinate pair.
pub fn validate_coordinates(lat: f64, lng: f64) -> Result<(), GeoError> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(GeoError::InvalidLatitude(lat));
    }
    if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
        return Err(GeoError::InvalidLongitude(lng));
    }
    Ok(())
}

/// Map a coordinate to its cell at the given precision.
pub fn cell_of(lat: f64, lng: f64, precision: u8) -> Result<Cell, GeoError> {
    validate_coordinates(lat, lng)?;
    if precision == 0 || precision > 12 {
        return Err(GeoError::InvalidPrecision(precision));
    }

    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lng_range = (-180.0_f64, 180.0_f64);

    let mut hash = String::with_capacity(precision as usize);
    let mut bits: u8 = 0;
    let mut bit_count: u8 = 0;
    let mut even_bit = true; // longitude first

    while hash.len() < precision as usize {
        if even_bit {
            let mid = (lng_range.0 + lng_range.1) / 2.0;
            if lng >= mid {
                bits = (bits << 1) | 1;
                lng_range.0 = mid;
            } else {
                bits <<= 1;
                lng_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if lat >= mid {
                bits = (bits << 1) | 1;
                lat_range.0 = mid;
            } else {
                bits <<= 1;
                lat_range.1 = mid;
            }
        }
        even_bit = !even_bit;
        bit_count += 1;

        if bit_count == 5 {
            hash.push(BASE32[bits as usize] as char);
            bits = 0;
            bit_count = 0;
        }
    }

    Ok(Cell(hash))
}

/// Center coordinates of a cell's bounding box.
pub fn cell_center(cell: &Cell) -> (f64, f64) {
    let ((min_lat, max_lat), (min_lng, max_lng)) = cell_bounds(cell);
    ((min_lat + max_lat) / 2.0, (min_lng + max_lng) / 2.0)
}

/// Bounding box of a cell: ((min_lat, max_lat), (min_lng, max_lng)).
pub fn cell_bounds(cell: &Cell) -> ((f64, f64), (f64, f64)) {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lng_range = (-180.0_f64, 180.0_f64);
    let mut even_bit = true;

    for ch in cell.as_str().bytes() {
        let idx = BASE32.iter().position(|&b| b == ch).unwrap_or(0);
        for shift in (0..5).rev() {
            let bit = (idx >> shift) & 1;
            if even_bit {
                let mid = (lng_range.0 + lng_range.1) / 2.0;
                if bit == 1 {
                    lng_range.0 = mid;
                } else {
                    lng_range.1 = mid;
                }
            } else {
                let mid = (lat_range.0 + lat_range.1) / 2.0;
                if bit == 1 {
                    lat_range.0 = mid;
                } else {
                    lat_range.1 = mid;
                }
            }
            even_bit = !even_bit;
        }
    }

    (lat_range, lng_range)
}

/// Cell dimensions in degrees at a precision: (lat_height, lng_width).
fn cell_dimensions(precision: u8) -> (f64, f64) {
    let total_bits = 5 * precision as u32;
    let lng_bits = total_bits.div_ceil(2);
    let lat_bits = total_bits / 2;
    (
        180.0 / (1u64 << lat_bits) as f64,
        360.0 / (1u64 << lng_bits) as f64,
    )
}

/// Great-circle distance between two points in miles.
pub fn haversine_miles(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_MILES * c
}

/// All cells whose area may intersect the disk of `radius_miles` around
/// the center.
///
/// Samples a padded bounding box at half-cell steps, so the result is a
/// superset of the true coverage: every point within the radius maps to a
/// returned cell. Cells just outside the boundary may also appear, which
/// is acceptable for subscription purposes.
pub fn cells_within_radius(
    lat: f64,
    lng: f64,
    radius_miles: f64,
    precision: u8,
) -> Result<BTreeSet<Cell>, GeoError> {
    validate_coordinates(lat, lng)?;
    if !radius_miles.is_finite() || radius_miles <= 0.0 {
        return Err(GeoError::InvalidRadius(radius_miles));
    }

    let (cell_h, cell_w) = cell_dimensions(precision);

    let lat_delta = radius_miles * LAT_DEGREES_PER_MILE;
    // Longitude degrees per mile shrink with latitude; clamp the cosine so
    // near-polar centers don't blow up the box.
    let cos_lat = lat.to_radians().cos().max(0.01);
    let lng_delta = radius_miles * LAT_DEGREES_PER_MILE / cos_lat;

    // Pad by one cell in each direction to cover boundary-straddling cells.
    let min_lat = (lat - lat_delta - cell_h).max(-90.0);
    let max_lat = (lat + lat_delta + cell_h).min(90.0);
    let min_lng = (lng - lng_delta - cell_w).max(-180.0);
    let max_lng = (lng + lng_delta + cell_w).min(180.0);

    let lat_step = cell_h / 2.0;
    let lng_step = cell_w / 2.0;

    let mut cells = BTreeSet::new();
    // The center cell is always covered.
    cells.insert(cell_of(lat, lng, precision)?);

    let mut sample_lat = min_lat;
    while sample_lat <= max_lat {
        let mut sample_lng = min_lng;
        while sample_lng <= max_lng {
            cells.insert(cell_of(sample_lat, sample_lng, precision)?);
            sample_lng += lng_step;
        }
        sample_lat += lat_step;
    }

    Ok(cells)
}
