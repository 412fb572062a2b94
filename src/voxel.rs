//! Regular 3D scalar field, ported from `voxels.h`/`voxelise.cpp`.
//!
//! Counting with numerator/denominator species splits, raw/density/
//! fraction/ratio post-processing, separable Gaussian convolution with
//! zero-extend or mirror boundary handling, axis-aligned slicing, and
//! marching-cubes isosurface extraction with the standard 256-case
//! table.

use crate::error::CoreError;
use crate::geometry::{BoundCube, Point3};
use crate::ion::IonHit;

mod mc_table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryMode {
    ZeroExtend,
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcess {
    RawCount,
    Density,
    Fraction,
    Ratio,
}

#[derive(Debug, Clone)]
pub struct VoxelGrid {
    pub bin_count: [usize; 3],
    pub min_bound: Point3,
    pub max_bound: Point3,
    data: Vec<f32>,
}

fn linear_index(bin_count: [usize; 3], i: usize, j: usize, k: usize) -> usize {
    (k * bin_count[1] + j) * bin_count[0] + i
}

impl VoxelGrid {
    pub fn new(bin_count: [usize; 3], min_bound: Point3, max_bound: Point3) -> Result<Self, CoreError> {
        if bin_count.iter().any(|&b| b == 0) {
            return Err(CoreError::DegenerateInput("voxel grid bin count must be positive on every axis".into()));
        }
        for a in 0..3 {
            if !(min_bound[a] < max_bound[a]) {
                return Err(CoreError::DegenerateInput("voxel grid bounds must have min < max on every axis".into()));
            }
        }
        let total = bin_count[0].checked_mul(bin_count[1]).and_then(|v| v.checked_mul(bin_count[2]));
        let total = match total {
            Some(t) if t < usize::MAX / 8 => t,
            _ => return Err(CoreError::OutOfMemory("voxel grid bin count overflows addressable memory".into())),
        };
        Ok(VoxelGrid { bin_count, min_bound, max_bound, data: vec![0.0; total] })
    }

    pub fn get(&self, i: usize, j: usize, k: usize) -> f32 {
        self.data[linear_index(self.bin_count, i, j, k)]
    }

    pub fn set(&mut self, i: usize, j: usize, k: usize, v: f32) {
        let idx = linear_index(self.bin_count, i, j, k);
        self.data[idx] = v;
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }

    pub fn bounds(&self) -> BoundCube {
        BoundCube::new(self.min_bound, self.max_bound)
    }

    fn bin_volume(&self) -> f32 {
        let b = self.bounds();
        (b.size(0) / self.bin_count[0] as f32) * (b.size(1) / self.bin_count[1] as f32) * (b.size(2) / self.bin_count[2] as f32)
    }

    /// Maps a world point to a bin index on `axis`, clamped to
    /// `[0, bin_count[axis])`.
    fn bin_of(&self, p: &Point3, axis: usize) -> usize {
        let span = self.max_bound[axis] - self.min_bound[axis];
        let frac = (p[axis] - self.min_bound[axis]) / span;
        let idx = (frac * self.bin_count[axis] as f32) as isize;
        idx.clamp(0, self.bin_count[axis] as isize - 1) as usize
    }

    fn bin_indices(&self, p: &Point3) -> Option<[usize; 3]> {
        if !self.bounds().contains_point(p) {
            return None;
        }
        Some([self.bin_of(p, 0), self.bin_of(p, 1), self.bin_of(p, 2)])
    }
}

/// Raw-count accumulation, split into numerator/denominator species sets
/// for later `PostProcess::Fraction`/`Ratio` selection. `total` counts
/// every ion regardless of species, independent of either set.
pub struct CountResult {
    pub numerator: VoxelGrid,
    pub denominator: VoxelGrid,
    pub total: VoxelGrid,
}

pub fn count_ions(
    ions: &[IonHit],
    species: &[usize],
    numerator_species: &std::collections::HashSet<usize>,
    denominator_species: &std::collections::HashSet<usize>,
    bin_count: [usize; 3],
    min_bound: Point3,
    max_bound: Point3,
) -> Result<CountResult, CoreError> {
    let mut numerator = VoxelGrid::new(bin_count, min_bound, max_bound)?;
    let mut denominator = VoxelGrid::new(bin_count, min_bound, max_bound)?;
    let mut total = VoxelGrid::new(bin_count, min_bound, max_bound)?;

    for (ion, &sp) in ions.iter().zip(species.iter()) {
        if let Some([i, j, k]) = total.bin_indices(&ion.pos) {
            total.set(i, j, k, total.get(i, j, k) + 1.0);
            if numerator_species.contains(&sp) {
                numerator.set(i, j, k, numerator.get(i, j, k) + 1.0);
            }
            if denominator_species.contains(&sp) {
                denominator.set(i, j, k, denominator.get(i, j, k) + 1.0);
            }
        }
    }

    Ok(CountResult { numerator, denominator, total })
}

/// Applies a post-processing selector to a counted grid pair, producing
/// the scalar field the voxel stream actually carries downstream.
pub fn post_process(counted: &CountResult, mode: PostProcess) -> VoxelGrid {
    let mut out = counted.total.clone();
    match mode {
        PostProcess::RawCount => {}
        PostProcess::Density => {
            let vol = out.bin_volume();
            for v in out.data.iter_mut() {
                *v /= vol;
            }
        }
        PostProcess::Fraction => {
            for (o, &n) in out.data.iter_mut().zip(counted.numerator.data.iter()) {
                let total = *o;
                *o = if total > 0.0 { n / total } else { 0.0 };
            }
        }
        PostProcess::Ratio => {
            for (o, (&n, &d)) in out.data.iter_mut().zip(counted.numerator.data.iter().zip(counted.denominator.data.iter()))
            {
                *o = if d > 0.0 { n / d } else { 0.0 };
            }
        }
    }
    out
}

fn gaussian_kernel_1d(width: usize, sigma: f32) -> Vec<f32> {
    let half = (width / 2) as isize;
    let mut kernel: Vec<f32> = (-half..=half)
        .map(|x| {
            let x = x as f32;
            (-0.5 * (x * x) / (sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}

fn sample_boundary(len: usize, idx: isize, mode: BoundaryMode) -> Option<usize> {
    if idx >= 0 && (idx as usize) < len {
        return Some(idx as usize);
    }
    match mode {
        BoundaryMode::ZeroExtend => None,
        BoundaryMode::Mirror => {
            let len = len as isize;
            let mut m = idx;
            while m < 0 || m >= len {
                if m < 0 {
                    m = -m - 1;
                } else {
                    m = 2 * len - m - 1;
                }
            }
            Some(m as usize)
        }
    }
}

/// Separable Gaussian convolution. `clip` removes `kernel_width - 1`
/// voxels per axis from the output rather than padding boundary
/// behaviour all the way to the edge, matching the original's
/// clip-mode size reduction.
pub fn convolve_gaussian(
    grid: &VoxelGrid,
    kernel_width: usize,
    sigma: f32,
    boundary: BoundaryMode,
    clip: bool,
) -> Result<VoxelGrid, CoreError> {
    if kernel_width == 0 || kernel_width % 2 == 0 {
        return Err(CoreError::DegenerateInput("gaussian kernel width must be odd and positive".into()));
    }
    let kernel = gaussian_kernel_1d(kernel_width, sigma);
    let half = (kernel_width / 2) as isize;

    let convolve_axis = |src: &VoxelGrid, axis: usize| -> VoxelGrid {
        let mut dst = src.clone();
        let [nx, ny, nz] = src.bin_count;
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = [i, j, k];
                    let mut acc = 0.0f32;
                    for (t, &w) in kernel.iter().enumerate() {
                        let offset = t as isize - half;
                        let mut sample_idx = idx;
                        let coord = idx[axis] as isize + offset;
                        match sample_boundary(src.bin_count[axis], coord, boundary) {
                            Some(c) => {
                                sample_idx[axis] = c;
                                acc += w * src.get(sample_idx[0], sample_idx[1], sample_idx[2]);
                            }
                            None => {}
                        }
                    }
                    dst.set(i, j, k, acc);
                }
            }
        }
        dst
    };

    let gx = convolve_axis(grid, 0);
    let gy = convolve_axis(&gx, 1);
    let gz = convolve_axis(&gy, 2);

    if !clip {
        return Ok(gz);
    }

    let shrink = kernel_width - 1;
    let new_count = [
        gz.bin_count[0].saturating_sub(shrink).max(1),
        gz.bin_count[1].saturating_sub(shrink).max(1),
        gz.bin_count[2].saturating_sub(shrink).max(1),
    ];
    let margin = shrink / 2;
    let voxel_size = Point3::new(
        gz.bounds().size(0) / gz.bin_count[0] as f32,
        gz.bounds().size(1) / gz.bin_count[1] as f32,
        gz.bounds().size(2) / gz.bin_count[2] as f32,
    );
    let min_bound = Point3::new(
        gz.min_bound.x + margin as f32 * voxel_size.x,
        gz.min_bound.y + margin as f32 * voxel_size.y,
        gz.min_bound.z + margin as f32 * voxel_size.z,
    );
    let max_bound = Point3::new(
        min_bound.x + new_count[0] as f32 * voxel_size.x,
        min_bound.y + new_count[1] as f32 * voxel_size.y,
        min_bound.z + new_count[2] as f32 * voxel_size.z,
    );
    let mut clipped = VoxelGrid::new(new_count, min_bound, max_bound)?;
    for k in 0..new_count[2] {
        for j in 0..new_count[1] {
            for i in 0..new_count[0] {
                clipped.set(i, j, k, gz.get(i + margin, j + margin, k + margin));
            }
        }
    }
    Ok(clipped)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceInterpolation {
    Nearest,
    Bilinear,
}

/// Extracts an axis-aligned plane at fractional offset `t in [0,1]`
/// along `axis`. Returns a row-major 2D array over the two remaining
/// axes, in axis-ascending order.
pub fn slice(grid: &VoxelGrid, axis: usize, t: f32, interp: SliceInterpolation) -> Result<Vec<Vec<f32>>, CoreError> {
    if !(0.0..=1.0).contains(&t) {
        return Err(CoreError::DegenerateInput(format!("slice offset {t} outside [0, 1]")));
    }
    let (u_axis, v_axis) = match axis {
        0 => (1, 2),
        1 => (0, 2),
        2 => (0, 1),
        _ => return Err(CoreError::DegenerateInput(format!("invalid slice axis {axis}"))),
    };

    let depth = grid.bin_count[axis] as f32;
    let pos = t * (depth - 1.0);
    let lo = pos.floor().clamp(0.0, depth - 1.0) as usize;
    let hi = pos.ceil().clamp(0.0, depth - 1.0) as usize;
    let frac = pos - lo as f32;

    let sample = |i: usize, j: usize, k: usize| -> f32 {
        let mut idx = [0usize; 3];
        idx[axis] = k;
        idx[u_axis] = i;
        idx[v_axis] = j;
        grid.get(idx[0], idx[1], idx[2])
    };

    let nu = grid.bin_count[u_axis];
    let nv = grid.bin_count[v_axis];
    let mut out = vec![vec![0.0f32; nv]; nu];
    for i in 0..nu {
        for j in 0..nv {
            out[i][j] = match interp {
                SliceInterpolation::Nearest => sample(i, j, pos.round().clamp(0.0, depth - 1.0) as usize),
                SliceInterpolation::Bilinear => sample(i, j, lo) * (1.0 - frac) + sample(i, j, hi) * frac,
            };
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    pub verts: [Point3; 3],
    pub normals: [Point3; 3],
}

/// Marching-cubes isosurface extraction at `iso_value`, using the
/// standard 256-case edge/triangle table and central-difference
/// gradients for vertex normals.
pub fn marching_cubes(grid: &VoxelGrid, iso_value: f32) -> Vec<Triangle> {
    let [nx, ny, nz] = grid.bin_count;
    let voxel_size = Point3::new(
        grid.bounds().size(0) / nx as f32,
        grid.bounds().size(1) / ny as f32,
        grid.bounds().size(2) / nz as f32,
    );

    let gradient = |i: isize, j: isize, k: isize| -> Point3 {
        let at = |i: isize, j: isize, k: isize| -> f32 {
            let i = i.clamp(0, nx as isize - 1) as usize;
            let j = j.clamp(0, ny as isize - 1) as usize;
            let k = k.clamp(0, nz as isize - 1) as usize;
            grid.get(i, j, k)
        };
        Point3::new(
            -(at(i + 1, j, k) - at(i - 1, j, k)) / (2.0 * voxel_size.x),
            -(at(i, j + 1, k) - at(i, j - 1, k)) / (2.0 * voxel_size.y),
            -(at(i, j, k + 1) - at(i, j, k - 1)) / (2.0 * voxel_size.z),
        )
    };

    let corner_pos = |i: usize, j: usize, k: usize| -> Point3 {
        Point3::new(
            grid.min_bound.x + i as f32 * voxel_size.x,
            grid.min_bound.y + j as f32 * voxel_size.y,
            grid.min_bound.z + k as f32 * voxel_size.z,
        )
    };

    let mut triangles = Vec::new();
    if nx < 2 || ny < 2 || nz < 2 {
        return triangles;
    }

    for k in 0..nz - 1 {
        for j in 0..ny - 1 {
            for i in 0..nx - 1 {
                let corner_idx = mc_table::CUBE_CORNER_OFFSETS;
                let values: [f32; 8] = std::array::from_fn(|c| {
                    let [ci, cj, ck] = corner_idx[c];
                    grid.get(i + ci, j + cj, k + ck)
                });

                let mut cube_index = 0usize;
                for (c, &v) in values.iter().enumerate() {
                    if v < iso_value {
                        cube_index |= 1 << c;
                    }
                }
                let edges = mc_table::EDGE_TABLE[cube_index];
                if edges == 0 {
                    continue;
                }

                let mut vert_list = [Point3::splat(0.0); 12];
                let mut norm_list = [Point3::splat(0.0); 12];
                for (e, &(a, b)) in mc_table::EDGE_CORNER_PAIRS.iter().enumerate() {
                    if edges & (1 << e) == 0 {
                        continue;
                    }
                    let [ai, aj, ak] = corner_idx[a];
                    let [bi, bj, bk] = corner_idx[b];
                    let va = values[a];
                    let vb = values[b];
                    let t = if (vb - va).abs() > 1e-12 { (iso_value - va) / (vb - va) } else { 0.5 };
                    let pa = corner_pos(i + ai, j + aj, k + ak);
                    let pb = corner_pos(i + bi, j + bj, k + bk);
                    vert_list[e] = pa + (pb - pa) * t;

                    let ga = gradient((i + ai) as isize, (j + aj) as isize, (k + ak) as isize);
                    let gb = gradient((i + bi) as isize, (j + bj) as isize, (k + bk) as isize);
                    norm_list[e] = (ga + (gb - ga) * t).normalised();
                }

                let tri_edges = &mc_table::TRIANGLE_TABLE[cube_index];
                let mut t = 0;
                while tri_edges[t] != -1 {
                    let e0 = tri_edges[t] as usize;
                    let e1 = tri_edges[t + 1] as usize;
                    let e2 = tri_edges[t + 2] as usize;
                    triangles.push(Triangle {
                        verts: [vert_list[e0], vert_list[e1], vert_list[e2]],
                        normals: [norm_list[e0], norm_list[e1], norm_list[e2]],
                    });
                    t += 3;
                }
            }
        }
    }

    triangles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_corner_ions() -> Vec<IonHit> {
        let mut ions = Vec::new();
        for &x in &[-3.5f32, 3.5] {
            for &y in &[-3.5f32, 3.5] {
                for &z in &[-3.5f32, 3.5] {
                    ions.push(IonHit::new(Point3::new(x, y, z), 0.0));
                }
            }
        }
        ions
    }

    // S4 -- voxel count of unit-cube corners.
    #[test]
    fn scenario_s4_voxel_count_conservation() {
        let ions = cube_corner_ions();
        let species = vec![0; ions.len()];
        let numerator_species = std::collections::HashSet::from([0]);
        let denominator_species = std::collections::HashSet::from([0]);
        let result = count_ions(
            &ions,
            &species,
            &numerator_species,
            &denominator_species,
            [4, 4, 4],
            Point3::splat(-3.5),
            Point3::splat(3.5),
        )
        .unwrap();
        let grid = post_process(&result, PostProcess::RawCount);
        assert_eq!(grid.sum() as usize, 8);
    }

    #[test]
    fn density_mode_divides_by_bin_volume() {
        let ions = cube_corner_ions();
        let species = vec![0; ions.len()];
        let numerator_species = std::collections::HashSet::new();
        let denominator_species = std::collections::HashSet::new();
        let result = count_ions(
            &ions,
            &species,
            &numerator_species,
            &denominator_species,
            [2, 2, 2],
            Point3::splat(-3.5),
            Point3::splat(3.5),
        )
        .unwrap();
        let raw = post_process(&result, PostProcess::RawCount);
        let density = post_process(&result, PostProcess::Density);
        let bin_vol = raw.bin_volume();
        for (r, d) in raw.data.iter().zip(density.data.iter()) {
            assert!((d - r / bin_vol).abs() < 1e-4);
        }
    }

    // Fraction divides per voxel by that voxel's total, Ratio by that
    // voxel's denominator-species count -- the two modes select a
    // different denominator and must not coincide in general.
    #[test]
    fn fraction_and_ratio_use_distinct_per_voxel_denominators() {
        let mut ions = vec![IonHit::new(Point3::new(-3.0, -3.0, -3.0), 0.0)];
        ions.push(IonHit::new(Point3::new(-3.0, -3.0, -2.9), 1.0));
        ions.push(IonHit::new(Point3::new(-3.0, -3.0, -2.8), 2.0));
        let species = vec![0usize, 1, 2];
        let numerator_species = std::collections::HashSet::from([0]);
        let denominator_species = std::collections::HashSet::from([0, 1]);
        let result = count_ions(
            &ions,
            &species,
            &numerator_species,
            &denominator_species,
            [1, 1, 1],
            Point3::splat(-3.5),
            Point3::splat(3.5),
        )
        .unwrap();

        let fraction = post_process(&result, PostProcess::Fraction);
        let ratio = post_process(&result, PostProcess::Ratio);
        // numerator = 1 (species 0), total = 3 ions, denominator-species count = 2.
        assert!((fraction.get(0, 0, 0) - 1.0 / 3.0).abs() < 1e-6);
        assert!((ratio.get(0, 0, 0) - 1.0 / 2.0).abs() < 1e-6);
    }

    #[test]
    fn slice_matches_direct_sample_at_grid_plane() {
        let mut grid = VoxelGrid::new([4, 4, 4], Point3::splat(0.0), Point3::splat(4.0)).unwrap();
        for k in 0..4 {
            grid.set(1, 1, k, k as f32);
        }
        let s = slice(&grid, 2, 2.0 / 3.0, SliceInterpolation::Nearest).unwrap();
        assert_eq!(s[1][1], 2.0);
    }

    #[test]
    fn marching_cubes_extracts_nonempty_surface_through_midpoint() {
        let mut grid = VoxelGrid::new([4, 4, 4], Point3::splat(0.0), Point3::splat(4.0)).unwrap();
        for k in 0..4 {
            for j in 0..4 {
                for i in 0..4 {
                    // A plane boundary: low half is 0, high half is 1.
                    grid.set(i, j, k, if k < 2 { 0.0 } else { 1.0 });
                }
            }
        }
        let tris = marching_cubes(&grid, 0.5);
        assert!(!tris.is_empty());
    }

    #[test]
    fn convolution_preserves_total_mass_with_zero_extend() {
        let mut grid = VoxelGrid::new([5, 5, 5], Point3::splat(0.0), Point3::splat(5.0)).unwrap();
        grid.set(2, 2, 2, 10.0);
        let smoothed = convolve_gaussian(&grid, 3, 1.0, BoundaryMode::ZeroExtend, false).unwrap();
        assert!((smoothed.sum() - grid.sum()).abs() < 1e-3);
    }
}
