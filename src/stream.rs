//! Typed stream bundle passed between subsystems, per spec.md §6.1.
//!
//! Replaces the original's virtual `FilterStreamData` hierarchy with a
//! tagged enum (REDESIGN FLAGS, spec.md §9). A producer either moves a
//! stream's payload to its consumer or keeps it cached and shares an
//! `Arc` handle — ownership is explicit in the type rather than implied
//! by a raw pointer's lifetime.

use std::sync::Arc;

use crate::geometry::Point3;
use crate::ion::IonHit;
use crate::range::RangeTable;
use crate::voxel::VoxelGrid;

#[derive(Debug, Clone)]
pub struct IonStreamData {
    pub ions: Arc<Vec<IonHit>>,
    /// Display colour hint, RGB 0.0-1.0.
    pub colour: (f32, f32, f32),
    pub point_size: f32,
}

#[derive(Debug, Clone)]
pub struct RangeStreamData {
    pub table: Arc<RangeTable>,
    /// Per-species "enabled" mask, indexed the same as `table.species()`;
    /// callers filter by range without mutating the shared table.
    pub species_enabled: Vec<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxelRepresentation {
    Cloud,
    Isosurface,
    AxialSlice,
}

#[derive(Debug, Clone)]
pub struct VoxelStreamData {
    pub grid: Arc<VoxelGrid>,
    pub representation: VoxelRepresentation,
    pub iso_level: f32,
    pub colour: (f32, f32, f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotErrorMode {
    None,
    StdDev,
    MinMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotStyle {
    Lines,
    Bars,
    Points,
}

#[derive(Debug, Clone)]
pub struct PlotStreamData {
    /// Disambiguates sibling plots emitted by the same node.
    pub index: usize,
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub log_y: bool,
    pub error_mode: PlotErrorMode,
    pub style: PlotStyle,
    pub x: Arc<Vec<f32>>,
    pub y: Arc<Vec<f32>>,
    /// Index ranges of `x` highlighted as regions of interest.
    pub regions: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Copy)]
pub enum Drawable {
    Vector { origin: Point3, direction: Point3 },
    Sphere { centre: Point3, radius: f32 },
    Triangle { verts: [Point3; 3] },
    TexturedQuad { corners: [Point3; 4] },
    ColourBar { min: f32, max: f32 },
}

#[derive(Debug, Clone)]
pub struct DrawStreamData {
    pub drawables: Arc<Vec<Drawable>>,
}

/// A tagged union of every stream payload subsystems exchange.
#[derive(Debug, Clone)]
pub enum FilterStreamData {
    Ion(IonStreamData),
    Range(RangeStreamData),
    Voxel(VoxelStreamData),
    Plot(PlotStreamData),
    Draw(DrawStreamData),
}

impl FilterStreamData {
    pub fn stream_type_name(&self) -> &'static str {
        match self {
            FilterStreamData::Ion(_) => "ion",
            FilterStreamData::Range(_) => "range",
            FilterStreamData::Voxel(_) => "voxel",
            FilterStreamData::Plot(_) => "plot",
            FilterStreamData::Draw(_) => "draw",
        }
    }

    pub fn as_ion(&self) -> Option<&IonStreamData> {
        match self {
            FilterStreamData::Ion(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<&RangeStreamData> {
        match self {
            FilterStreamData::Range(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_voxel(&self) -> Option<&VoxelStreamData> {
        match self {
            FilterStreamData::Voxel(d) => Some(d),
            _ => None,
        }
    }
}
