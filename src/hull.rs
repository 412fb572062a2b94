//! Convex hull construction and inward shrink-reduction.
//!
//! The original computes hulls with a hand-rolled QuickHull
//! (`getConvexHull` in `voxels.cpp`'s neighbourhood); we use `parry3d`'s
//! maintained QuickHull implementation instead (grounded via the
//! `ncollide`-derived stack seen elsewhere in the retrieval pack) and
//! port the original's hull-reduction and pyramid-volume-sum estimators
//! on top of its output.

use crate::error::CoreError;
use crate::geometry::{pyramid_volume, Point3};

/// A convex hull as a triangle soup: `vertices[indices[3i..3i+3]]` gives
/// triangle `i`.
#[derive(Debug, Clone)]
pub struct ConvexHull {
    pub vertices: Vec<Point3>,
    pub indices: Vec<[u32; 3]>,
}

impl ConvexHull {
    /// Builds the convex hull of `points`. Requires at least 4
    /// non-coplanar points.
    pub fn build(points: &[Point3]) -> Result<Self, CoreError> {
        if points.len() < 4 {
            return Err(CoreError::InsufficientPoints { have: points.len(), need: 4 });
        }

        let pts: Vec<parry3d::na::Point3<f32>> =
            points.iter().map(|p| parry3d::na::Point3::new(p.x, p.y, p.z)).collect();

        let (verts, idxs) = parry3d::transformation::convex_hull(&pts);
        if verts.len() < 4 {
            return Err(CoreError::DegenerateInput(
                "point set is coplanar or otherwise degenerate; no 3D hull exists".into(),
            ));
        }

        Ok(ConvexHull {
            vertices: verts.iter().map(|v| Point3::new(v.x, v.y, v.z)).collect(),
            indices: idxs,
        })
    }

    /// Hull volume via the sum of tetrahedron volumes from an interior
    /// apex (the vertex centroid) to each face, matching the original's
    /// `Voxels::getHullVolume` strategy.
    pub fn volume(&self) -> f32 {
        let apex = self.vertex_centroid();
        self.indices
            .iter()
            .map(|idx| {
                let a = self.vertices[idx[0] as usize];
                let b = self.vertices[idx[1] as usize];
                let c = self.vertices[idx[2] as usize];
                pyramid_volume(apex, a, b, c)
            })
            .sum()
    }

    fn vertex_centroid(&self) -> Point3 {
        let n = self.vertices.len() as f32;
        let sum = self.vertices.iter().fold(Point3::splat(0.0), |acc, &p| acc + p);
        sum / n
    }

    /// Mass-weighted centroid, mass = per-facet pyramid volume (apex at
    /// the vertex centroid), used by [`ConvexHull::shrink`]'s
    /// surface-exclusion scaling (spec.md §4.3). Falls back to the
    /// vertex centroid if the hull's total volume is degenerate.
    pub fn centroid(&self) -> Point3 {
        let apex = self.vertex_centroid();
        let mut weighted = Point3::splat(0.0);
        let mut total_volume = 0.0f32;
        for idx in &self.indices {
            let a = self.vertices[idx[0] as usize];
            let b = self.vertices[idx[1] as usize];
            let c = self.vertices[idx[2] as usize];
            let vol = pyramid_volume(apex, a, b, c);
            let facet_centroid = (apex + a + b + c) / 4.0;
            weighted = weighted + facet_centroid * vol;
            total_volume += vol;
        }
        if total_volume <= 0.0 {
            apex
        } else {
            weighted / total_volume
        }
    }

    /// Shrinks the hull inward by scaling every vertex toward the
    /// centroid by `scale` (in `(0, 1]`), used by the RDF engine's
    /// surface-exclusion mode (§4.3) to approximate "points further than
    /// `d` from the surface" without an exact offset-surface computation,
    /// mirroring the original's `reduce` approach of scaling the hull
    /// about its centroid by a volume-derived factor.
    pub fn shrink(&self, scale: f32) -> Result<ConvexHull, CoreError> {
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(CoreError::DegenerateInput(format!(
                "hull shrink scale must be in (0, 1], got {scale}"
            )));
        }
        let centroid = self.centroid();
        let vertices = self
            .vertices
            .iter()
            .map(|&v| centroid + (v - centroid) * scale)
            .collect();
        Ok(ConvexHull { vertices, indices: self.indices.clone() })
    }

    /// Point-in-hull test via the sign of each face's plane equation.
    /// Assumes outward-wound triangles, as `parry3d::transformation::convex_hull`
    /// produces.
    pub fn contains(&self, p: &Point3) -> bool {
        for idx in &self.indices {
            let a = self.vertices[idx[0] as usize];
            let b = self.vertices[idx[1] as usize];
            let c = self.vertices[idx[2] as usize];
            let normal = (b - a).cross(&(c - a));
            if normal.dot(&(*p - a)) > 0.0 {
                return false;
            }
        }
        true
    }

    /// Distance from `scale` for a shrink that reduces hull volume by the
    /// given absolute margin `d`, approximated as a uniform linear scale
    /// under the assumption the hull is roughly convex-regular: since
    /// volume scales with the cube of a linear factor, the original's
    /// depth-based exclusion is approximated as `scale = 1 - d / r_eff`,
    /// where `r_eff` is the hull's effective radius (cube root of
    /// `3 * volume / (4 * pi)`).
    pub fn shrink_scale_for_margin(&self, d: f32) -> Result<f32, CoreError> {
        let vol = self.volume();
        if vol <= 0.0 {
            return Err(CoreError::DegenerateInput("hull has non-positive volume".into()));
        }
        let r_eff = (3.0 * vol / (4.0 * std::f32::consts::PI)).cbrt();
        let scale = 1.0 - d / r_eff;
        if scale <= 0.0 {
            return Err(CoreError::DegenerateInput(format!(
                "surface-exclusion margin {d} exceeds hull's effective radius {r_eff}"
            )));
        }
        Ok(scale)
    }
}
