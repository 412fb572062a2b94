//! Core-link-erode cluster decomposition, ported from
//! `clusterAnalysis.cpp`'s `refreshLinkClustering`.
//!
//! Species are partitioned by the caller into core-capable and
//! bulk-capable sets (a species may be neither, and the two sets are
//! disjoint by construction of the caller's range assignment — this
//! module doesn't enforce that itself). The pipeline: collate, optional
//! core reclassification, backbone growth by linkage, optional
//! pre-filter crop, optional bulk envelope, optional erosion, size crop,
//! re-collate.

use std::collections::{BTreeMap, HashSet, VecDeque};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::geometry::Point3;
use crate::ion::{IonHit, UNRANGED};
use crate::kdtree::KdTree;
use crate::stream::Drawable;
use crate::progress::{Cancellation, ProgressData};

/// Expected-points-in-search-sphere threshold above which the bulk
/// envelope switches from pure `findNearestUntagged` crawling to a
/// `getTreesInSphere` bulk grab followed by a crawl for the remainder.
pub const SPHERE_PRESEARCH_CUTOFF: f32 = 75.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    pub enable_core_classify: bool,
    pub core_dist: f32,
    pub core_knn: usize,
    pub link_dist: f32,
    pub enable_bulk_link: bool,
    pub bulk_link: f32,
    pub enable_erosion: bool,
    pub d_erosion: f32,
    pub want_crop_size: bool,
    pub n_min: usize,
    pub n_max: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterParams {
            enable_core_classify: false,
            core_dist: 0.0,
            core_knn: 1,
            link_dist: 0.5,
            enable_bulk_link: false,
            bulk_link: 1.0,
            enable_erosion: false,
            d_erosion: 0.25,
            want_crop_size: false,
            n_min: 0,
            n_max: usize::MAX,
        }
    }
}

/// One cluster: parallel core and bulk ion lists, core first by
/// invariant (spec.md §5: "within a single cluster's ion list, the
/// core-ion subsequence precedes the bulk-ion subsequence").
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    pub core: Vec<IonHit>,
    pub bulk: Vec<IonHit>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.core.len() + self.bulk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ions(&self) -> impl Iterator<Item = &IonHit> {
        self.core.iter().chain(self.bulk.iter())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterDecomposition {
    pub clusters: Vec<Cluster>,
}

fn build_tree_over(ions: &[IonHit], ids: &[usize]) -> Result<KdTree, CoreError> {
    let points: Vec<Point3> = ids.iter().map(|&i| ions[i].pos).collect();
    let mut tree = KdTree::new();
    tree.reset(&points);
    let mut progress = ProgressData::new();
    tree.build(&mut progress, &mut crate::progress::NeverCancel)?;
    Ok(tree)
}

/// Runs the full core-link-erode pipeline. `species` is a parallel array
/// giving each ion's range-table species index (or [`UNRANGED`]);
/// `core_species`/`bulk_species` select which species participate in
/// each role. Returns the decomposition plus any non-fatal warnings
/// (the original's `bulkLink > linkDist/2` non-determinism notice, and
/// similar advisories).
pub fn refresh_link_clustering(
    ions: &[IonHit],
    species: &[usize],
    core_species: &HashSet<usize>,
    bulk_species: &HashSet<usize>,
    params: &ClusterParams,
    progress: &mut ProgressData,
    cancel: &mut impl Cancellation,
) -> Result<(ClusterDecomposition, Vec<String>), CoreError> {
    let mut warnings = Vec::new();
    if params.enable_bulk_link && params.bulk_link > params.link_dist / 2.0 {
        warnings.push(format!(
            "bulkLink ({}) exceeds linkDist/2 ({}); bulk point ownership near cluster boundaries \
             depends on traversal order and is not deterministic across runs",
            params.bulk_link,
            params.link_dist / 2.0
        ));
    }

    // 1. Collate.
    progress.begin_step("Collate");
    let mut core_ids: Vec<usize> = Vec::new();
    let mut bulk_ids: Vec<usize> = Vec::new();
    for (i, &sp) in species.iter().enumerate() {
        if sp != UNRANGED && core_species.contains(&sp) {
            core_ids.push(i);
        } else if sp != UNRANGED && bulk_species.contains(&sp) {
            bulk_ids.push(i);
        }
    }
    log::debug!("cluster: collated {} core, {} bulk candidate ions", core_ids.len(), bulk_ids.len());

    if params.enable_bulk_link && bulk_ids.is_empty() {
        return Err(CoreError::MissingPrerequisite("no bulk ions".into()));
    }

    // 2. Core classification (optional).
    progress.begin_step("Classify Core");
    let mut core_tree = build_tree_over(ions, &core_ids)?;
    if !cancel.keep_going() {
        return Err(CoreError::Aborted);
    }

    if params.enable_core_classify {
        let core_dist_sqr = params.core_dist * params.core_dist;
        let bounds = core_tree.bounds();
        let mut reclassified = vec![false; core_tree.len()];

        for t in 0..core_tree.len() {
            let query = core_tree.point_at(t);
            core_tree.tag(t, true);
            let mut touched = vec![t];
            let mut last_found: Option<usize> = None;
            for _ in 0..params.core_knn {
                match core_tree.find_nearest_untagged(&query, &bounds) {
                    Some(j) => {
                        touched.push(j);
                        last_found = Some(j);
                    }
                    None => break,
                }
            }
            let demote = match last_found {
                Some(j) => core_tree.point_at(j).sqr_dist(&query) >= core_dist_sqr,
                None => true,
            };
            core_tree.clear_tags(&touched);
            reclassified[t] = demote;

            if t % crate::progress::PROGRESS_REDUCE == 0 {
                progress.set_progress_fraction(t, core_tree.len());
                if !cancel.keep_going() {
                    return Err(CoreError::Aborted);
                }
            }
        }

        let mut kept_core = Vec::new();
        for t in 0..core_tree.len() {
            let abs = core_ids[core_tree.original_index(t)];
            if reclassified[t] {
                bulk_ids.push(abs);
            } else {
                kept_core.push(abs);
            }
        }
        core_ids = kept_core;
        core_tree = build_tree_over(ions, &core_ids)?;
    }

    if core_ids.is_empty() {
        return Err(CoreError::MissingPrerequisite("no core ions".into()));
    }
    if params.enable_bulk_link && bulk_ids.is_empty() {
        return Err(CoreError::MissingPrerequisite("no bulk ions".into()));
    }

    // 3. Backbone growth.
    progress.begin_step("Grow Backbone");
    let core_bounds = core_tree.bounds();
    let link_dist_sqr = params.link_dist * params.link_dist;
    let mut core_clusters: Vec<Vec<usize>> = Vec::new();

    for seed in 0..core_tree.len() {
        if core_tree.is_tagged(seed) {
            continue;
        }
        core_tree.tag(seed, true);
        let mut members = vec![seed];
        let mut queue = VecDeque::from([seed]);

        while let Some(claim) = queue.pop_front() {
            let claim_pt = core_tree.point_at(claim);
            loop {
                match core_tree.find_nearest_untagged(&claim_pt, &core_bounds) {
                    Some(j) => {
                        let d = core_tree.point_at(j).sqr_dist(&claim_pt);
                        if d <= link_dist_sqr {
                            members.push(j);
                            queue.push_back(j);
                        } else {
                            core_tree.tag(j, false);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        core_clusters.push(members);

        if seed % crate::progress::PROGRESS_REDUCE == 0 {
            progress.set_progress_fraction(seed, core_tree.len());
            if !cancel.keep_going() {
                return Err(CoreError::Aborted);
            }
        }
    }

    // 4. Pre-filter crop (speedup): only meaningful when bulk linking is
    // disabled, since otherwise bulk membership still has to be computed
    // before the true size is known (Open Question 6 in spec.md §9).
    if !params.enable_bulk_link && params.want_crop_size {
        core_clusters.retain(|c| c.len() >= params.n_min && c.len() <= params.n_max);
    }

    // 5. Bulk envelope (optional).
    let mut bulk_clusters: Vec<Vec<usize>> = vec![Vec::new(); core_clusters.len()];
    if params.enable_bulk_link {
        progress.begin_step("Bulk Envelope");
        let mut bulk_tree = build_tree_over(ions, &bulk_ids)?;
        let bulk_bounds = bulk_tree.bounds();
        let bulk_link_sqr = params.bulk_link * params.bulk_link;

        let expected_pts_in_search = if bulk_bounds.volume() > 0.0 {
            (bulk_tree.len() as f32 / bulk_bounds.volume()) * (4.0 / 3.0) * std::f32::consts::PI
                * params.bulk_link.powi(3)
        } else {
            0.0
        };
        let use_sphere_presearch = expected_pts_in_search > SPHERE_PRESEARCH_CUTOFF;

        for (ci, core_members) in core_clusters.iter().enumerate() {
            let mut claimed = Vec::new();
            for &core_tree_idx in core_members {
                let core_pt = core_tree.point_at(core_tree_idx);

                if use_sphere_presearch {
                    let mut runs = Vec::new();
                    bulk_tree.get_trees_in_sphere(&core_pt, bulk_link_sqr, &bulk_bounds, &mut runs);
                    for (lo, hi) in runs {
                        for idx in lo..=hi {
                            if !bulk_tree.is_tagged(idx) {
                                bulk_tree.tag(idx, true);
                                claimed.push(idx);
                            }
                        }
                    }
                }

                loop {
                    match bulk_tree.find_nearest_untagged(&core_pt, &bulk_bounds) {
                        Some(j) => {
                            let d = bulk_tree.point_at(j).sqr_dist(&core_pt);
                            if d <= bulk_link_sqr {
                                claimed.push(j);
                            } else {
                                bulk_tree.tag(j, false);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            bulk_clusters[ci] = claimed;

            if ci % crate::progress::PROGRESS_REDUCE == 0 {
                progress.set_progress_fraction(ci, core_clusters.len());
                if !cancel.keep_going() {
                    return Err(CoreError::Aborted);
                }
            }
        }

        // 6. Erosion (optional, single pass, read-only tree queries fan
        // out over `rayon` since they never mutate tag state).
        if params.enable_erosion {
            progress.begin_step("Erode");
            let d_erosion_sqr = params.d_erosion * params.d_erosion;
            let bulk_tree_ref = &bulk_tree;
            bulk_clusters = bulk_clusters
                .into_par_iter()
                .map(|members| {
                    members
                        .into_iter()
                        .filter(|&m| {
                            let p = bulk_tree_ref.point_at(m);
                            match bulk_tree_ref.find_nearest_untagged_readonly(&p, &bulk_bounds) {
                                Some(j) => bulk_tree_ref.point_at(j).sqr_dist(&p) > d_erosion_sqr,
                                None => true,
                            }
                        })
                        .collect()
                })
                .collect();
        }

        build_decomposition(ions, &core_ids, &core_tree, &core_clusters, &bulk_ids, &bulk_tree, &bulk_clusters, params, &mut warnings)
    } else {
        // 7. Size crop (bulk disabled: size == core count, already
        // applied as the pre-filter in step 4 when requested; otherwise
        // apply it now).
        if params.want_crop_size {
            core_clusters.retain(|c| c.len() >= params.n_min && c.len() <= params.n_max);
        }
        let empty_bulk_tree = KdTree::new();
        build_decomposition(ions, &core_ids, &core_tree, &core_clusters, &[], &empty_bulk_tree, &bulk_clusters, params, &mut warnings)
    }
}

#[allow(clippy::too_many_arguments)]
fn build_decomposition(
    ions: &[IonHit],
    core_ids: &[usize],
    core_tree: &KdTree,
    core_clusters: &[Vec<usize>],
    bulk_ids: &[usize],
    bulk_tree: &KdTree,
    bulk_clusters: &[Vec<usize>],
    params: &ClusterParams,
    warnings: &mut Vec<String>,
) -> Result<(ClusterDecomposition, Vec<String>), CoreError> {
    let mut clusters = Vec::with_capacity(core_clusters.len());
    for (core_members, bulk_members) in core_clusters.iter().zip(bulk_clusters.iter()) {
        let core: Vec<IonHit> =
            core_members.iter().map(|&t| ions[core_ids[core_tree.original_index(t)]]).collect();
        let bulk: Vec<IonHit> =
            bulk_members.iter().map(|&t| ions[bulk_ids[bulk_tree.original_index(t)]]).collect();
        clusters.push(Cluster { core, bulk });
    }

    // 8. Size crop, when bulk linking was enabled (size = core + bulk).
    if params.enable_bulk_link && params.want_crop_size {
        clusters.retain(|c| c.len() >= params.n_min && c.len() <= params.n_max);
    }

    if warnings.is_empty() {
        log::debug!("cluster: produced {} clusters", clusters.len());
    }
    Ok((ClusterDecomposition { clusters }, std::mem::take(warnings)))
}

/// Size histogram: `|core| + |bulk|` per cluster, keyed by size.
pub fn size_distribution(decomp: &ClusterDecomposition) -> BTreeMap<usize, usize> {
    let mut hist = BTreeMap::new();
    for c in &decomp.clusters {
        *hist.entry(c.len()).or_insert(0) += 1;
    }
    hist
}

/// Composition distribution: for each cluster size, species counts
/// summed across every cluster of that size, with a trailing "unranged"
/// bucket at index `num_species`. When `normalise` is set, each row is
/// divided by its row total.
pub fn composition_distribution(
    decomp: &ClusterDecomposition,
    species_of: impl Fn(&IonHit) -> usize,
    num_species: usize,
    normalise: bool,
) -> BTreeMap<usize, Vec<f32>> {
    let mut table: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
    for c in &decomp.clusters {
        let row = table.entry(c.len()).or_insert_with(|| vec![0.0; num_species + 1]);
        for ion in c.ions() {
            let sp = species_of(ion);
            if sp == UNRANGED {
                row[num_species] += 1.0;
            } else {
                row[sp] += 1.0;
            }
        }
    }
    if normalise {
        for row in table.values_mut() {
            let total: f32 = row.iter().sum();
            if total > 0.0 {
                for v in row.iter_mut() {
                    *v /= total;
                }
            }
        }
    }
    table
}

/// Cluster morphology: singular values `(lambda1 >= lambda2 >= lambda3)`
/// of the centroid-referenced displacement matrix, plus the associated
/// right singular vectors (principal axes), for clusters with at least
/// 4 points. Ported from the original's `getSingularValues`.
pub struct Morphology {
    pub singular_values: [f32; 3],
    pub axes: [Point3; 3],
    pub centroid: Point3,
    /// `(lambda1/lambda2, lambda2/lambda3)`, the shape-classification plot
    /// point (spec.md §4.2: rod-like vs. disc-like vs. spherical clusters
    /// separate in this plane).
    pub axis_ratio_plot_point: (f32, f32),
    /// Three orthogonal segments at the cluster centroid, one per
    /// principal axis scaled by its singular value, for a drawable
    /// ellipsoid-axis overlay.
    pub axis_segments: [Drawable; 3],
}

pub fn cluster_morphology(cluster: &Cluster) -> Option<Morphology> {
    let n = cluster.len();
    if n < 4 {
        return None;
    }

    let points: Vec<Point3> = cluster.ions().map(|ion| ion.pos).collect();
    let centroid = points.iter().fold(Point3::splat(0.0), |acc, &p| acc + p) / n as f32;

    let mut mat = nalgebra::DMatrix::<f32>::zeros(n, 3);
    for (i, p) in points.iter().enumerate() {
        let d = *p - centroid;
        mat[(i, 0)] = d.x;
        mat[(i, 1)] = d.y;
        mat[(i, 2)] = d.z;
    }

    let svd = mat.svd(false, true);
    let mut values = [svd.singular_values[0], svd.singular_values[1], svd.singular_values[2]];
    let v_t = svd.v_t?;

    let mut axes = [
        Point3::new(v_t[(0, 0)], v_t[(0, 1)], v_t[(0, 2)]),
        Point3::new(v_t[(1, 0)], v_t[(1, 1)], v_t[(1, 2)]),
        Point3::new(v_t[(2, 0)], v_t[(2, 1)], v_t[(2, 2)]),
    ];

    // nalgebra's SVD already returns singular values in descending order;
    // the pairing below just keeps axes/values visually coupled should
    // that ever not hold for a degenerate input.
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap());
    if order != [0, 1, 2] {
        values = [values[order[0]], values[order[1]], values[order[2]]];
        axes = [axes[order[0]], axes[order[1]], axes[order[2]]];
    }

    let axis_ratio_plot_point = (
        if values[1] > 0.0 { values[0] / values[1] } else { f32::INFINITY },
        if values[2] > 0.0 { values[1] / values[2] } else { f32::INFINITY },
    );
    let axis_segments = [
        Drawable::Vector { origin: centroid, direction: axes[0] * values[0] },
        Drawable::Vector { origin: centroid, direction: axes[1] * values[1] },
        Drawable::Vector { origin: centroid, direction: axes[2] * values[2] },
    ];

    Some(Morphology { singular_values: values, axes, centroid, axis_ratio_plot_point, axis_segments })
}

/// Overwrites each ion's mass-to-charge with its (zero-based) cluster
/// index, for downstream by-cluster colouring. Mutually exclusive with
/// composition output on the same stream, per spec.md §4.2.
pub fn overwrite_with_cluster_id(decomp: &ClusterDecomposition) -> Vec<IonHit> {
    let mut out = Vec::new();
    for (idx, c) in decomp.clusters.iter().enumerate() {
        for ion in c.ions() {
            out.push(IonHit::new(ion.pos, idx as f32));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ion(x: f32, y: f32, z: f32) -> IonHit {
        IonHit::new(Point3::new(x, y, z), 0.0)
    }

    fn run(
        ions: &[IonHit],
        species: &[usize],
        core: &[usize],
        bulk: &[usize],
        params: ClusterParams,
    ) -> (ClusterDecomposition, Vec<String>) {
        let core_set: HashSet<usize> = core.iter().copied().collect();
        let bulk_set: HashSet<usize> = bulk.iter().copied().collect();
        let mut progress = ProgressData::new();
        refresh_link_clustering(ions, species, &core_set, &bulk_set, &params, &mut progress, &mut crate::progress::NeverCancel)
            .unwrap()
    }

    // S1 -- isolated cluster, no bulk.
    #[test]
    fn scenario_s1_isolated_cluster() {
        let ions = vec![ion(0.0, 0.0, 0.0), ion(0.0, 0.0, 1.0), ion(0.0, 1.0, 1.0), ion(0.0, 1.0, 2.0), ion(1.0, 1.0, 2.0)];
        let species = vec![0; 5];
        let params = ClusterParams { link_dist: 1.1, ..Default::default() };
        let (decomp, _) = run(&ions, &species, &[0], &[], params);

        assert_eq!(decomp.clusters.len(), 1);
        assert_eq!(decomp.clusters[0].len(), 5);
        assert!(decomp.clusters[0].bulk.is_empty());
    }

    // S3 -- core classification rejects stragglers.
    #[test]
    fn scenario_s3_core_classification() {
        let ions = vec![
            ion(0.0, 0.0, 0.0),
            ion(0.0, 1.0, 0.0),
            ion(1.0, 0.0, 0.0),
            ion(0.0, 0.0, 2.0),
            ion(0.0, 0.0, 4.0),
            ion(0.0, -1.0, 4.0),
        ];
        let species = vec![0; 6];
        let params = ClusterParams {
            enable_core_classify: true,
            core_dist: 1.1,
            core_knn: 1,
            link_dist: 2.0,
            ..Default::default()
        };
        let (decomp, _) = run(&ions, &species, &[0], &[], params);

        let total: usize = decomp.clusters.iter().map(|c| c.len()).sum();
        assert_eq!(total, 5, "one straggler must be reclassified out of core, dropping total to 5");
    }

    #[test]
    fn no_core_ions_is_an_error() {
        let ions = vec![ion(0.0, 0.0, 0.0)];
        let species = vec![UNRANGED];
        let err = refresh_link_clustering(
            &ions,
            &species,
            &HashSet::from([0]),
            &HashSet::new(),
            &ClusterParams::default(),
            &mut ProgressData::new(),
            &mut crate::progress::NeverCancel,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::MissingPrerequisite(_)));
    }

    #[test]
    fn bulk_link_without_bulk_species_is_an_error() {
        let ions = vec![ion(0.0, 0.0, 0.0)];
        let species = vec![0];
        let params = ClusterParams { enable_bulk_link: true, ..Default::default() };
        let err = refresh_link_clustering(
            &ions,
            &species,
            &HashSet::from([0]),
            &HashSet::new(),
            &params,
            &mut ProgressData::new(),
            &mut crate::progress::NeverCancel,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::MissingPrerequisite(_)));
    }

    // Property 4: cluster partitioning -- no ion in two clusters, core
    // and bulk disjoint within a cluster.
    #[test]
    fn property_cluster_partitioning() {
        let ions = vec![ion(0.0, 0.0, 0.0), ion(0.0, 0.0, 1.0), ion(5.0, 5.0, 5.0), ion(5.0, 5.0, 6.0)];
        let species = vec![0; 4];
        let params = ClusterParams { link_dist: 1.5, ..Default::default() };
        let (decomp, _) = run(&ions, &species, &[0], &[], params);

        let mut seen = HashSet::new();
        for c in &decomp.clusters {
            for ion in c.ions() {
                let key = (ion.pos.x.to_bits(), ion.pos.y.to_bits(), ion.pos.z.to_bits());
                assert!(seen.insert(key), "ion {ion:?} appears in more than one cluster");
            }
        }
    }

    #[test]
    fn bulk_link_warning_surfaced_when_nondeterministic() {
        let ions = vec![ion(0.0, 0.0, 0.0), ion(0.5, 0.0, 0.0)];
        let species = vec![0, 1];
        let params = ClusterParams { enable_bulk_link: true, bulk_link: 1.0, link_dist: 0.5, ..Default::default() };
        let (_, warnings) = run(&ions, &species, &[0], &[1], params);
        assert!(!warnings.is_empty());
    }

    #[test]
    fn morphology_reports_plot_point_and_axis_segments() {
        // An elongated rod along x: lambda1 should dominate lambda2, lambda3.
        let cluster = Cluster {
            core: vec![
                ion(-3.0, 0.0, 0.0),
                ion(-1.0, 0.1, -0.1),
                ion(1.0, -0.1, 0.1),
                ion(3.0, 0.0, 0.0),
                ion(0.0, 0.1, 0.0),
            ],
            bulk: vec![],
        };
        let morph = cluster_morphology(&cluster).unwrap();
        assert!(morph.singular_values[0] > morph.singular_values[1]);
        assert!(morph.singular_values[1] >= morph.singular_values[2]);
        assert!(morph.axis_ratio_plot_point.0 > 1.0, "a rod-like cluster should have lambda1 >> lambda2");
        for (segment, &value) in morph.axis_segments.iter().zip(morph.singular_values.iter()) {
            match segment {
                Drawable::Vector { origin, direction } => {
                    assert_eq!(*origin, morph.centroid);
                    assert!((direction.magnitude() - value).abs() < 1e-3);
                }
                _ => panic!("expected a Vector drawable"),
            }
        }
    }

    #[test]
    fn size_distribution_counts_clusters_by_size() {
        let ions = vec![ion(0.0, 0.0, 0.0), ion(0.0, 0.0, 1.0), ion(10.0, 10.0, 10.0)];
        let species = vec![0; 3];
        let params = ClusterParams { link_dist: 1.1, ..Default::default() };
        let (decomp, _) = run(&ions, &species, &[0], &[], params);
        let hist = size_distribution(&decomp);
        assert_eq!(hist.get(&2), Some(&1));
        assert_eq!(hist.get(&1), Some(&1));
    }
}
