//! Radial/axial distribution-function engine, ported from
//! `spatialAnalysis.cpp`.
//!
//! Two families of histogram: NN-terminated (one histogram per
//! neighbour rank, binned after a max-distance pre-pass) and
//! radius-terminated (one histogram, fixed `[0, distMax]` span). Both
//! have an axial variant that projects displacements onto a
//! user-specified cylinder axis instead of binning raw distance.

use crate::error::CoreError;
use crate::geometry::Point3;
use crate::hull::ConvexHull;
use crate::kdtree::KdTree;
use crate::progress::{Cancellation, ProgressData, PROGRESS_REDUCE};

/// A uniform 1D histogram over `[lo, hi]`.
#[derive(Debug, Clone)]
pub struct Histogram {
    pub lo: f32,
    pub hi: f32,
    pub counts: Vec<u32>,
}

impl Histogram {
    pub fn new(lo: f32, hi: f32, num_bins: usize) -> Self {
        Histogram { lo, hi, counts: vec![0; num_bins.max(1)] }
    }

    pub fn add(&mut self, value: f32) {
        if self.hi <= self.lo {
            self.counts[0] += 1;
            return;
        }
        let frac = (value - self.lo) / (self.hi - self.lo);
        let idx = ((frac * self.counts.len() as f32) as isize).clamp(0, self.counts.len() as isize - 1) as usize;
        self.counts[idx] += 1;
    }

    pub fn non_zero_bins(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}

/// Widens `max_observed` by 5% and builds a histogram spanning `[0,
/// padded_max]`, matching the original's two-pass NN-histogram binning.
fn padded_histogram(max_observed: f32, num_bins: usize) -> Histogram {
    let padded = if max_observed > 0.0 { max_observed * 1.05 } else { 1.0 };
    Histogram::new(0.0, padded, num_bins)
}

fn build_tree(points: &[Point3]) -> Result<KdTree, CoreError> {
    let mut tree = KdTree::new();
    tree.reset(points);
    let mut progress = ProgressData::new();
    tree.build(&mut progress, &mut crate::progress::NeverCancel)?;
    Ok(tree)
}

/// Restricts `points` to those inside a hull shrunk inward by `margin`
/// about its mass-weighted centroid, per spec.md §4.3's surface
/// exclusion. Mass is the per-facet pyramid volume, folded into
/// [`ConvexHull::centroid`]'s weighting.
pub fn exclude_surface(points: &[Point3], margin: f32) -> Result<Vec<Point3>, CoreError> {
    let hull = ConvexHull::build(points)?;
    let scale = hull.shrink_scale_for_margin(margin)?;
    let shrunk = hull.shrink(scale)?;
    Ok(points.iter().copied().filter(|p| shrunk.contains(p)).collect())
}

/// NN-terminated radial distribution: one histogram per rank `1..=nn_max`.
pub fn nn_radial(
    sources: &[Point3],
    targets: &[Point3],
    nn_max: usize,
    num_bins: usize,
    progress: &mut ProgressData,
    cancel: &mut impl Cancellation,
) -> Result<Vec<Histogram>, CoreError> {
    if nn_max == 0 {
        return Ok(Vec::new());
    }
    let mut tree = build_tree(targets)?;
    let bounds = tree.bounds();

    progress.begin_step("RDF Pass 1: Range Estimate");
    let mut max_per_rank = vec![0.0f32; nn_max];
    for (i, src) in sources.iter().enumerate() {
        let mut touched = Vec::with_capacity(nn_max);
        for rank in 0..nn_max {
            match tree.find_nearest_untagged(src, &bounds) {
                Some(j) => {
                    touched.push(j);
                    let d = tree.point_at(j).dist(src);
                    if d > max_per_rank[rank] {
                        max_per_rank[rank] = d;
                    }
                }
                None => break,
            }
        }
        tree.clear_tags(&touched);

        if i % PROGRESS_REDUCE == 0 {
            progress.set_progress_fraction(i, sources.len());
            if !cancel.keep_going() {
                return Err(CoreError::Aborted);
            }
        }
    }

    progress.begin_step("RDF Pass 2: Accumulate");
    let mut histograms: Vec<Histogram> = max_per_rank.iter().map(|&m| padded_histogram(m, num_bins)).collect();
    for (i, src) in sources.iter().enumerate() {
        let mut touched = Vec::with_capacity(nn_max);
        for rank in 0..nn_max {
            match tree.find_nearest_untagged(src, &bounds) {
                Some(j) => {
                    touched.push(j);
                    let d = tree.point_at(j).dist(src);
                    histograms[rank].add(d);
                }
                None => break,
            }
        }
        tree.clear_tags(&touched);

        if i % PROGRESS_REDUCE == 0 {
            progress.set_progress_fraction(i, sources.len());
            if !cancel.keep_going() {
                return Err(CoreError::Aborted);
            }
        }
    }

    Ok(histograms)
}

/// Radius-terminated radial distribution: one histogram over `[0,
/// dist_max]`. Returns the histogram plus the indices of sources whose
/// target set was exhausted before reaching `dist_max` (the original's
/// "bias-warned" sources: their tail of the histogram is systematically
/// under-populated and display code should flag this).
pub fn radius_radial(
    sources: &[Point3],
    targets: &[Point3],
    dist_max: f32,
    num_bins: usize,
    progress: &mut ProgressData,
    cancel: &mut impl Cancellation,
) -> Result<(Histogram, Vec<usize>), CoreError> {
    let mut tree = build_tree(targets)?;
    let bounds = tree.bounds();
    let mut histogram = Histogram::new(0.0, dist_max, num_bins);
    let mut bias_warned = Vec::new();

    for (i, src) in sources.iter().enumerate() {
        let mut touched = Vec::new();
        loop {
            match tree.find_nearest_untagged(src, &bounds) {
                Some(j) => {
                    touched.push(j);
                    let d = tree.point_at(j).dist(src);
                    if d <= dist_max {
                        histogram.add(d);
                    } else {
                        tree.tag(j, false);
                        touched.pop();
                        break;
                    }
                }
                None => {
                    bias_warned.push(i);
                    break;
                }
            }
        }
        tree.clear_tags(&touched);

        if i % PROGRESS_REDUCE == 0 {
            progress.set_progress_fraction(i, sources.len());
            if !cancel.keep_going() {
                return Err(CoreError::Aborted);
            }
        }
    }

    Ok((histogram, bias_warned))
}

/// An infinite cylinder used to select axial-mode source/target points.
#[derive(Debug, Clone, Copy)]
pub struct Cylinder {
    pub centre: Point3,
    pub axis: Point3, // must be unit length
    pub radius: f32,
}

impl Cylinder {
    pub fn contains(&self, p: &Point3) -> bool {
        let d = *p - self.centre;
        let along = d.dot(&self.axis);
        let radial = d - self.axis * along;
        radial.magnitude() <= self.radius
    }

    /// The signed projection of `p` onto the cylinder axis, relative to
    /// the cylinder's centre.
    pub fn project(&self, p: &Point3) -> f32 {
        (*p - self.centre).dot(&self.axis)
    }
}

/// Axial distribution function: sources are ions inside `cylinder`,
/// targets are all ions within `dist_max` of the cylinder. Projections
/// onto the axis are binned signed into `[-dist_max, dist_max]`.
pub fn axial_radius(
    all_points: &[Point3],
    cylinder: &Cylinder,
    dist_max: f32,
    num_bins: usize,
    progress: &mut ProgressData,
    cancel: &mut impl Cancellation,
) -> Result<(Histogram, Vec<usize>), CoreError> {
    let sources: Vec<Point3> = all_points.iter().copied().filter(|p| cylinder.contains(p)).collect();
    let expanded = Cylinder { radius: cylinder.radius + dist_max, ..*cylinder };
    let targets: Vec<Point3> = all_points
        .iter()
        .copied()
        .filter(|p| expanded.contains(p) && cylinder.project(p).abs() <= dist_max + cylinder.radius)
        .collect();

    if sources.is_empty() {
        return Err(CoreError::InsufficientPoints { have: 0, need: 1 });
    }

    let mut tree = build_tree(&targets)?;
    let bounds = tree.bounds();
    let mut histogram = Histogram::new(-dist_max, dist_max, num_bins);
    let mut bias_warned = Vec::new();

    for (i, src) in sources.iter().enumerate() {
        let mut touched = Vec::new();
        loop {
            match tree.find_nearest_untagged(src, &bounds) {
                Some(j) => {
                    touched.push(j);
                    let d = tree.point_at(j).dist(src);
                    if d <= dist_max {
                        histogram.add(cylinder.project(&tree.point_at(j)) - cylinder.project(src));
                    } else {
                        tree.tag(j, false);
                        touched.pop();
                        break;
                    }
                }
                None => {
                    bias_warned.push(i);
                    break;
                }
            }
        }
        tree.clear_tags(&touched);

        if i % PROGRESS_REDUCE == 0 {
            progress.set_progress_fraction(i, sources.len());
            if !cancel.keep_going() {
                return Err(CoreError::Aborted);
            }
        }
    }

    Ok((histogram, bias_warned))
}

#[cfg(test)]
mod tests {
    use super::*;

    // S5 -- RDF smoke test.
    #[test]
    fn scenario_s5_nn_mode() {
        let sources = vec![Point3::new(0.0, 0.0, 0.0)];
        let targets = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(0.0, 0.0, 1.0)];
        let mut progress = ProgressData::new();
        let histograms = nn_radial(&sources, &targets, 1, 10, &mut progress, &mut crate::progress::NeverCancel).unwrap();
        assert_eq!(histograms.len(), 1);
        assert_eq!(histograms[0].non_zero_bins(), 1);
    }

    #[test]
    fn scenario_s5_radius_mode() {
        let sources = vec![Point3::new(0.0, 0.0, 0.0)];
        let targets = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(0.0, 0.0, 1.0)];
        let mut progress = ProgressData::new();
        let (hist, _) = radius_radial(&sources, &targets, 2.0, 10, &mut progress, &mut crate::progress::NeverCancel).unwrap();
        assert_eq!(hist.non_zero_bins(), 1);
    }

    #[test]
    fn radius_mode_flags_bias_warned_sources() {
        let sources = vec![Point3::new(0.0, 0.0, 0.0)];
        let targets = vec![Point3::new(0.0, 0.0, 0.5)];
        let mut progress = ProgressData::new();
        let (_, bias_warned) =
            radius_radial(&sources, &targets, 10.0, 10, &mut progress, &mut crate::progress::NeverCancel).unwrap();
        assert_eq!(bias_warned, vec![0]);
    }

    #[test]
    fn cylinder_contains_and_projects() {
        let cyl = Cylinder { centre: Point3::new(0.0, 0.0, 0.0), axis: Point3::new(0.0, 0.0, 1.0), radius: 1.0 };
        assert!(cyl.contains(&Point3::new(0.5, 0.0, 5.0)));
        assert!(!cyl.contains(&Point3::new(2.0, 0.0, 5.0)));
        assert_eq!(cyl.project(&Point3::new(0.0, 0.0, 3.0)), 3.0);
    }

    #[test]
    fn surface_exclusion_shrinks_inward() {
        let mut points = Vec::new();
        for &x in &[0.0f32, 1.0] {
            for &y in &[0.0f32, 1.0] {
                for &z in &[0.0f32, 1.0] {
                    points.push(Point3::new(x, y, z));
                }
            }
        }
        let reduced = exclude_surface(&points, 0.1).unwrap();
        assert!(reduced.len() < points.len());
    }
}
