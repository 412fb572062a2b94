//! Balanced, tagged, index-based 3D KD-tree ("mk2"), ported from
//! `K3DTree-mk2.{h,cpp}`.
//!
//! Two parallel arrays (`indexed_points`, `nodes`) hold a flat,
//! recursion-free tree: points are permuted into median-split order
//! during [`KdTree::build`], and each node's position in the array *is*
//! its split index — there is no separate node allocation. Queries
//! (`find_nearest_untagged`, `get_trees_in_sphere`) are iterative
//! state machines over an explicit stack/queue, per the REDESIGN FLAGS
//! in spec.md §9 (no recursion, no coroutine-shaped closures).

use crate::error::CoreError;
use crate::geometry::{BoundCube, Point3};
use crate::progress::{Cancellation, ProgressData, PROGRESS_REDUCE};

#[derive(Debug, Clone, Copy)]
struct KdNode {
    child_left: Option<usize>,
    child_right: Option<usize>,
    tagged: bool,
}

impl Default for KdNode {
    fn default() -> Self {
        KdNode { child_left: None, child_right: None, tagged: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Visit {
    First,
    Second,
    Third,
}

struct StackFrame {
    node: usize,
    visit: Visit,
    domain_range: (f32, f32),
}

/// A flat, balanced 3D KD-tree over indexed points.
#[derive(Debug, Default)]
pub struct KdTree {
    // (point, original index prior to build's in-place permutation)
    indexed_points: Vec<(Point3, usize)>,
    nodes: Vec<KdNode>,
    root: Option<usize>,
    bounds: BoundCube,
    max_depth: usize,
}

impl KdTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `points` into the tree's internal array, recording each
    /// point's pre-build position as its original index, and computes
    /// the bounding box of the input. Does not build the tree.
    pub fn reset(&mut self, points: &[Point3]) {
        self.bounds = BoundCube::from_points(points);
        self.indexed_points = points.iter().copied().enumerate().map(|(i, p)| (p, i)).collect();
        self.nodes = vec![KdNode::default(); points.len()];
        self.root = None;
        self.max_depth = 0;
    }

    pub fn len(&self) -> usize {
        self.indexed_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexed_points.is_empty()
    }

    pub fn bounds(&self) -> BoundCube {
        self.bounds
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn point_at(&self, tree_index: usize) -> Point3 {
        self.indexed_points[tree_index].0
    }

    pub fn original_index(&self, tree_index: usize) -> usize {
        self.indexed_points[tree_index].1
    }

    pub fn tag(&mut self, tree_index: usize, tagged: bool) {
        self.nodes[tree_index].tagged = tagged;
    }

    pub fn is_tagged(&self, tree_index: usize) -> bool {
        self.nodes[tree_index].tagged
    }

    pub fn clear_tags(&mut self, tags: &[usize]) {
        for &t in tags {
            self.nodes[t].tagged = false;
        }
    }

    pub fn clear_all_tags(&mut self) {
        for n in &mut self.nodes {
            n.tagged = false;
        }
    }

    pub fn tag_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.tagged).count()
    }

    /// Builds the tree in place using an explicit stack of
    /// `(sub-range, build state, split index)` frames stepping through
    /// `NONE -> LEFT -> BOTH`, exactly mirroring the original's
    /// recursion-free build. Splits are the median of the sub-range
    /// after sorting on the current axis (`depth mod 3`); on ties the
    /// split is advanced upward so that equal-valued points land on the
    /// left, preserving the tree invariant.
    pub fn build(
        &mut self,
        progress: &mut ProgressData,
        cancel: &mut impl Cancellation,
    ) -> Result<(), CoreError> {
        self.clear_all_tags();
        self.max_depth = 0;

        if self.indexed_points.is_empty() {
            return Ok(());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum BuildState {
            None,
            Left,
            Both,
        }

        enum ParentSlot {
            Root,
            Left(usize),
            Right(usize),
        }

        struct BuildFrame {
            lo: usize,
            hi: usize, // inclusive
            state: BuildState,
            split: usize,
            parent_slot: ParentSlot,
        }

        let n = self.indexed_points.len();
        let mut stack = vec![BuildFrame { lo: 0, hi: n - 1, state: BuildState::None, split: 0, parent_slot: ParentSlot::Root }];

        let mut num_seen = 0usize;

        while !stack.is_empty() {
            let stack_len = stack.len();
            let frame = stack.last_mut().unwrap();
            match frame.state {
                BuildState::None => {
                    let axis = (stack_len - 1) % 3;
                    let lo = frame.lo;
                    let hi = frame.hi;

                    self.indexed_points[lo..=hi]
                        .sort_by(|a, b| a.0[axis].partial_cmp(&b.0[axis]).unwrap());

                    let mut split = (lo + hi) / 2;
                    while split != hi && self.indexed_points[split].0[axis] == self.indexed_points[split + 1].0[axis] {
                        split += 1;
                    }

                    frame.split = split;
                    frame.state = BuildState::Left;

                    match frame.parent_slot {
                        ParentSlot::Root => self.root = Some(split),
                        ParentSlot::Left(parent) => self.nodes[parent].child_left = Some(split),
                        ParentSlot::Right(parent) => self.nodes[parent].child_right = Some(split),
                    }

                    if split > lo {
                        stack.push(BuildFrame {
                            lo,
                            hi: split - 1,
                            state: BuildState::None,
                            split: 0,
                            parent_slot: ParentSlot::Left(split),
                        });
                    }
                }
                BuildState::Left => {
                    frame.state = BuildState::Both;
                    let split = frame.split;
                    let hi = frame.hi;
                    if split < hi {
                        stack.push(BuildFrame {
                            lo: split + 1,
                            hi,
                            state: BuildState::None,
                            split: 0,
                            parent_slot: ParentSlot::Right(split),
                        });
                    }
                }
                BuildState::Both => {
                    self.max_depth = self.max_depth.max(stack.len());
                    stack.pop();

                    num_seen += 1;
                    if num_seen % PROGRESS_REDUCE == 0 {
                        progress.set_progress_fraction(num_seen, n);
                        if !cancel.keep_going() {
                            return Err(CoreError::Aborted);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Finds the closest untagged point to `query_pt` with squared
    /// distance strictly greater than the initial (infinite) best, i.e.
    /// the nearest untagged point in the tree. `domain_box` is the
    /// world-space bound the traversal starts from (normally
    /// `self.bounds()`). Tags the result before returning. Returns
    /// `None` on an empty tree or if every point is tagged.
    pub fn find_nearest_untagged(&mut self, query_pt: &Point3, domain_box: &BoundCube) -> Option<usize> {
        let best = self.search_nearest_untagged(query_pt, domain_box);
        if let Some(bp) = best {
            self.nodes[bp].tagged = true;
        }
        best
    }

    /// Read-only variant of [`KdTree::find_nearest_untagged`] that never
    /// tags its result. Used where a query must not perturb tag state —
    /// the cluster engine's erosion pass checks proximity to unclaimed
    /// bulk points without claiming them, and unlike the tagging query
    /// this one is safe to call concurrently from multiple threads since
    /// it only reads node state.
    pub fn find_nearest_untagged_readonly(&self, query_pt: &Point3, domain_box: &BoundCube) -> Option<usize> {
        self.search_nearest_untagged(query_pt, domain_box)
    }

    fn search_nearest_untagged(&self, query_pt: &Point3, domain_box: &BoundCube) -> Option<usize> {
        let root = self.root?;

        let mut best_point: Option<usize> = None;
        let mut best_dist_sqr = f32::INFINITY;
        let mut cur_domain = *domain_box;
        let mut visit = Visit::First;
        let mut cur_axis = 0usize;
        let mut cur_node = root;
        let mut stack: Vec<StackFrame> = Vec::with_capacity(self.max_depth + 1);

        if !self.nodes[cur_node].tagged {
            let d = self.indexed_points[cur_node].0.sqr_dist(query_pt);
            if d < best_dist_sqr {
                best_dist_sqr = d;
                best_point = Some(cur_node);
            }
        }

        loop {
            match visit {
                Visit::First => {
                    let branch_left = query_pt[cur_axis] < self.indexed_points[cur_node].0[cur_axis];
                    let child = if branch_left {
                        self.nodes[cur_node].child_left
                    } else {
                        self.nodes[cur_node].child_right
                    };

                    if let Some(child_idx) = child {
                        let split_val = self.indexed_points[cur_node].0[cur_axis];
                        let tmp_edge;
                        let pushed_range;
                        if branch_left {
                            tmp_edge = cur_domain.hi[cur_axis];
                            cur_domain.hi[cur_axis] = split_val;
                            pushed_range = (cur_domain.lo[cur_axis], tmp_edge);
                        } else {
                            tmp_edge = cur_domain.lo[cur_axis];
                            cur_domain.lo[cur_axis] = split_val;
                            pushed_range = (tmp_edge, cur_domain.hi[cur_axis]);
                        }

                        if !cur_domain.intersects(query_pt, best_dist_sqr) {
                            if branch_left {
                                cur_domain.hi[cur_axis] = tmp_edge;
                            } else {
                                cur_domain.lo[cur_axis] = tmp_edge;
                            }
                            visit = Visit::Second;
                            continue;
                        }

                        stack.push(StackFrame { node: cur_node, visit: Visit::Second, domain_range: pushed_range });
                        cur_node = child_idx;
                        visit = Visit::First;
                        cur_axis = (cur_axis + 1) % 3;
                        continue;
                    }
                    visit = Visit::Second;
                    continue;
                }
                Visit::Second => {
                    // Examine the far side of the splitting plane.
                    let branch_left_was_first = query_pt[cur_axis] < self.indexed_points[cur_node].0[cur_axis];
                    let child = if branch_left_was_first {
                        self.nodes[cur_node].child_right
                    } else {
                        self.nodes[cur_node].child_left
                    };

                    if let Some(child_idx) = child {
                        let split_val = self.indexed_points[cur_node].0[cur_axis];
                        let tmp_edge;
                        let pushed_range;
                        // The far side bounds the *opposite* half relative to First.
                        if branch_left_was_first {
                            tmp_edge = cur_domain.lo[cur_axis];
                            cur_domain.lo[cur_axis] = split_val;
                            pushed_range = (tmp_edge, cur_domain.hi[cur_axis]);
                        } else {
                            tmp_edge = cur_domain.hi[cur_axis];
                            cur_domain.hi[cur_axis] = split_val;
                            pushed_range = (cur_domain.lo[cur_axis], tmp_edge);
                        }

                        if !cur_domain.intersects(query_pt, best_dist_sqr) {
                            if branch_left_was_first {
                                cur_domain.lo[cur_axis] = tmp_edge;
                            } else {
                                cur_domain.hi[cur_axis] = tmp_edge;
                            }
                            visit = Visit::Third;
                            continue;
                        }

                        stack.push(StackFrame { node: cur_node, visit: Visit::Third, domain_range: pushed_range });
                        cur_node = child_idx;
                        visit = Visit::First;
                        cur_axis = (cur_axis + 1) % 3;
                        continue;
                    }
                    visit = Visit::Third;
                    continue;
                }
                Visit::Third => {
                    if !self.nodes[cur_node].tagged {
                        let d = self.indexed_points[cur_node].0.sqr_dist(query_pt);
                        if d < best_dist_sqr {
                            best_dist_sqr = d;
                            best_point = Some(cur_node);
                        }
                    }

                    cur_axis = if cur_axis == 0 { 2 } else { cur_axis - 1 };

                    match stack.pop() {
                        Some(frame) => {
                            cur_domain.lo[cur_axis] = frame.domain_range.0;
                            cur_domain.hi[cur_axis] = frame.domain_range.1;
                            cur_node = frame.node;
                            visit = frame.visit;
                        }
                        None => break,
                    }
                }
            }
        }

        best_point
    }

    /// Breadth-first extraction of contiguous index runs whose subtree
    /// domain is entirely inside the sphere `(centre, sqrt(sqr_dist))`.
    /// Runs are appended to `out`; callers must scan each run linearly
    /// (some boundary-straddling runs may also be emitted, per spec.md
    /// property 3).
    pub fn get_trees_in_sphere(
        &self,
        centre: &Point3,
        sqr_dist: f32,
        domain_box: &BoundCube,
        out: &mut Vec<(usize, usize)>,
    ) {
        let Some(root) = self.root else { return };
        let n = self.indexed_points.len();

        struct QueueItem {
            node: usize,
            axis: usize,
            domain: BoundCube,
            range: (usize, usize),
        }

        let mut queue = std::collections::VecDeque::new();
        queue.push_back(QueueItem { node: root, axis: 0, domain: *domain_box, range: (0, n - 1) });

        while let Some(item) = queue.pop_front() {
            if item.domain.contained_in_sphere(centre, sqr_dist) {
                out.push(item.range);
                continue;
            }
            if !item.domain.intersects(centre, sqr_dist) {
                continue;
            }

            let split_val = self.indexed_points[item.node].0[item.axis];
            let next_axis = (item.axis + 1) % 3;

            if let Some(left) = self.nodes[item.node].child_left {
                let mut left_domain = item.domain;
                left_domain.hi[item.axis] = split_val;
                if left_domain.intersects(centre, sqr_dist) {
                    queue.push_back(QueueItem {
                        node: left,
                        axis: next_axis,
                        domain: left_domain,
                        range: (item.range.0, item.node - 1),
                    });
                }
            }

            if let Some(right) = self.nodes[item.node].child_right {
                let mut right_domain = item.domain;
                right_domain.lo[item.axis] = split_val;
                if right_domain.intersects(centre, sqr_dist) {
                    queue.push_back(QueueItem {
                        node: right,
                        axis: next_axis,
                        domain: right_domain,
                        range: (item.node + 1, item.range.1),
                    });
                }
            }
        }
    }
}
