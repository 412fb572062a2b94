//! Local-density filter, ported from the density-filter half of
//! `spatialAnalysis.cpp`.
//!
//! Two ways to estimate a point's local density: the radius of its
//! `nnMax`-th nearest other point (`StopMode::Neighbour`), or the count
//! of other points within a fixed radius (`StopMode::Radius`). Either
//! way a point is kept when `(density <= cutoff) XOR retain_upper`, so
//! `retain_upper` flips which side of the cutoff survives.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::geometry::Point3;
use crate::ion::IonHit;
use crate::kdtree::KdTree;
use crate::progress::{Cancellation, ProgressData, PROGRESS_REDUCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopMode {
    Neighbour,
    Radius,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensityParams {
    pub stop_mode: StopMode,
    pub nn_max: usize,
    pub dist_max: f32,
    pub density_cutoff: f32,
    pub retain_upper: bool,
}

impl Default for DensityParams {
    fn default() -> Self {
        DensityParams { stop_mode: StopMode::Neighbour, nn_max: 1, dist_max: 1.0, density_cutoff: 1.0, retain_upper: false }
    }
}

fn sphere_volume(r: f32) -> f32 {
    4.0 / 3.0 * std::f32::consts::PI * r * r * r
}

/// Applies the density filter to `ions` against a local-density estimate
/// computed over the same point cloud (each ion's own position is
/// excluded from its own neighbour search). Returns the retained ions
/// plus a warning if any point had too few neighbours to classify (the
/// original's "N points were un-analysable" notice) — such points are
/// dropped rather than classified either way.
pub fn filter(
    ions: &[IonHit],
    params: &DensityParams,
    progress: &mut ProgressData,
    cancel: &mut impl Cancellation,
) -> Result<(Vec<IonHit>, Vec<String>), CoreError> {
    if ions.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    progress.begin_step("Build");
    let points: Vec<Point3> = ions.iter().map(|ion| ion.pos).collect();
    let mut tree = KdTree::new();
    tree.reset(&points);
    tree.build(progress, cancel)?;
    let bounds = tree.bounds();

    progress.begin_step("Analyse");
    let mut kept = Vec::with_capacity(ions.len());
    let mut under_populated = 0usize;

    for i in 0..tree.len() {
        let query = tree.point_at(i);
        tree.tag(i, true);
        let mut touched = vec![i];

        let density = match params.stop_mode {
            StopMode::Neighbour => {
                let mut last_dist = None;
                for _ in 0..params.nn_max {
                    match tree.find_nearest_untagged(&query, &bounds) {
                        Some(j) => {
                            touched.push(j);
                            last_dist = Some(tree.point_at(j).dist(&query));
                        }
                        None => break,
                    }
                }
                last_dist.map(|r| params.nn_max as f32 / sphere_volume(r))
            }
            StopMode::Radius => {
                let mut count = 0u32;
                let mut exhausted = false;
                loop {
                    match tree.find_nearest_untagged(&query, &bounds) {
                        Some(j) => {
                            touched.push(j);
                            if tree.point_at(j).dist(&query) <= params.dist_max {
                                count += 1;
                            } else {
                                break;
                            }
                        }
                        None => {
                            exhausted = true;
                            break;
                        }
                    }
                }
                if exhausted && count == 0 {
                    None
                } else {
                    Some(count as f32 / sphere_volume(params.dist_max))
                }
            }
        };

        tree.clear_tags(&touched);

        match density {
            Some(d) => {
                if (d <= params.density_cutoff) != params.retain_upper {
                    kept.push(ions[tree.original_index(i)]);
                }
            }
            None => under_populated += 1,
        }

        if i % PROGRESS_REDUCE == 0 {
            progress.set_progress_fraction(i, tree.len());
            if !cancel.keep_going() {
                return Err(CoreError::Aborted);
            }
        }
    }

    let mut warnings = Vec::new();
    if under_populated > 0 {
        warnings.push(format!(
            "{under_populated} points had too few neighbours to estimate a local density and were dropped"
        ));
    }
    log::debug!("density: kept {} of {} ions, {} un-analysable", kept.len(), ions.len(), under_populated);

    Ok((kept, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ion(x: f32, y: f32, z: f32) -> IonHit {
        IonHit::new(Point3::new(x, y, z), 0.0)
    }

    #[test]
    fn neighbour_mode_drops_sparse_points_by_default() {
        // A tight trio plus one far-flung straggler.
        let ions = vec![ion(0.0, 0.0, 0.0), ion(0.0, 0.0, 0.1), ion(0.0, 0.0, 0.2), ion(100.0, 100.0, 100.0)];
        let params = DensityParams { stop_mode: StopMode::Neighbour, nn_max: 1, density_cutoff: 50.0, retain_upper: false, ..Default::default() };
        let mut progress = ProgressData::new();
        let (kept, warnings) = filter(&ions, &params, &mut progress, &mut crate::progress::NeverCancel).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(kept.len(), 3, "the three close-packed ions have high density and should be dropped when keeping sparse points");
    }

    #[test]
    fn retain_upper_flips_which_side_survives() {
        let ions = vec![ion(0.0, 0.0, 0.0), ion(0.0, 0.0, 0.1), ion(0.0, 0.0, 0.2), ion(100.0, 100.0, 100.0)];
        let mut params = DensityParams { stop_mode: StopMode::Neighbour, nn_max: 1, density_cutoff: 50.0, retain_upper: false, ..Default::default() };
        let mut progress = ProgressData::new();
        let (kept_low, _) = filter(&ions, &params, &mut progress, &mut crate::progress::NeverCancel).unwrap();
        params.retain_upper = true;
        let mut progress2 = ProgressData::new();
        let (kept_high, _) = filter(&ions, &params, &mut progress2, &mut crate::progress::NeverCancel).unwrap();
        assert_eq!(kept_low.len() + kept_high.len(), 3, "the two modes should partition the classifiable points");
    }

    #[test]
    fn radius_mode_counts_neighbours_within_distance() {
        let ions = vec![ion(0.0, 0.0, 0.0), ion(0.0, 0.0, 0.5), ion(0.0, 0.0, 10.0)];
        let params = DensityParams { stop_mode: StopMode::Radius, dist_max: 1.0, density_cutoff: 0.0, retain_upper: true, ..Default::default() };
        let mut progress = ProgressData::new();
        let (kept, _) = filter(&ions, &params, &mut progress, &mut crate::progress::NeverCancel).unwrap();
        assert_eq!(kept.len(), 2, "the two close ions each have one neighbour within range, the isolated one has zero");
    }

    #[test]
    fn single_point_has_no_neighbours_and_is_warned_about() {
        let ions = vec![ion(0.0, 0.0, 0.0)];
        let params = DensityParams { stop_mode: StopMode::Neighbour, nn_max: 1, ..Default::default() };
        let mut progress = ProgressData::new();
        let (kept, warnings) = filter(&ions, &params, &mut progress, &mut crate::progress::NeverCancel).unwrap();
        assert!(kept.is_empty());
        assert_eq!(warnings.len(), 1);
    }
}
