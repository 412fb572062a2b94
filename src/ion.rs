//! The `IonHit`: one atomic event, a position plus a mass-to-charge
//! scalar. Ported from `APTClasses`' `IonHit`, trimmed to the fields this
//! crate's engines actually consume (no XML/file-format methods — those
//! belong to the external loader, per spec Non-goals).

use crate::geometry::Point3;

/// Sentinel species index meaning "value did not fall in any range".
pub const UNRANGED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IonHit {
    pub pos: Point3,
    pub mass_to_charge: f32,
}

impl IonHit {
    pub fn new(pos: Point3, mass_to_charge: f32) -> Self {
        IonHit { pos, mass_to_charge }
    }
}
