//! Ion-population summary, ported from `ionInfo.cpp`.
//!
//! Species counts (with an unranged bucket and optional normalisation),
//! volume estimation by either rectilinear bounds or convex hull, and
//! density as count over volume when both were requested.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::geometry::{BoundCube, Point3};
use crate::hull::ConvexHull;
use crate::ion::UNRANGED;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeAlgorithm {
    Rectilinear,
    ConvexHull,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IonInfoParams {
    pub want_ion_counts: bool,
    pub want_normalise: bool,
    pub want_volume: bool,
    pub volume_algorithm: VolumeAlgorithm,
}

impl Default for IonInfoParams {
    fn default() -> Self {
        IonInfoParams {
            want_ion_counts: true,
            want_normalise: false,
            want_volume: false,
            volume_algorithm: VolumeAlgorithm::Rectilinear,
        }
    }
}

/// Per-species counts with a trailing unranged bucket at `num_species`.
#[derive(Debug, Clone)]
pub struct SpeciesCounts {
    pub counts: Vec<usize>,
    pub total_ranged: usize,
    pub total: usize,
}

pub fn count_species(species: &[usize], num_species: usize) -> SpeciesCounts {
    let mut counts = vec![0usize; num_species + 1];
    for &sp in species {
        if sp == UNRANGED {
            counts[num_species] += 1;
        } else {
            counts[sp] += 1;
        }
    }
    let total_ranged: usize = counts[..num_species].iter().sum();
    SpeciesCounts { total_ranged, total: species.len(), counts }
}

impl SpeciesCounts {
    /// Fraction of the total each bucket represents. Uses
    /// `total_ranged` as the denominator, matching the original's
    /// normalisation (unranged ions don't dilute a species' share).
    pub fn normalised(&self) -> Option<Vec<f32>> {
        if self.total_ranged == 0 {
            return None;
        }
        Some(self.counts.iter().map(|&c| c as f32 / self.total_ranged as f32).collect())
    }
}

/// Rectilinear (axis-aligned bounding box) volume, by incremental
/// `BoundCube` expansion over every point.
pub fn rectilinear_volume(points: &[Point3]) -> Result<(BoundCube, f32), CoreError> {
    if points.is_empty() {
        return Err(CoreError::InsufficientPoints { have: 0, need: 1 });
    }
    let bound = BoundCube::from_points(points);
    if !bound.is_valid() {
        return Err(CoreError::DegenerateInput("rectilinear bounds are degenerate".into()));
    }
    Ok((bound, bound.volume()))
}

/// Convex-hull volume, by apex-at-centroid pyramid decomposition over
/// every hull facet (see [`ConvexHull::volume`]).
pub fn convex_hull_volume(points: &[Point3]) -> Result<f32, CoreError> {
    let hull = ConvexHull::build(points)?;
    Ok(hull.volume())
}

#[derive(Debug, Clone, Copy)]
pub struct DensityReport {
    pub ranged_density: Option<f32>,
    pub total_density: f32,
}

/// Density as count/volume, computed only when the volume is
/// numerically meaningful (matches the original's `sqrt(epsilon)`
/// floor against reporting a density blown up by a near-zero volume).
pub fn density(species_counts: &SpeciesCounts, volume: f32, has_range: bool) -> Option<DensityReport> {
    if volume <= f32::EPSILON.sqrt() {
        return None;
    }
    Some(DensityReport {
        ranged_density: has_range.then(|| species_counts.total_ranged as f32 / volume),
        total_density: species_counts.total as f32 / volume,
    })
}
