//! In-memory range-table contract (§6.2): ordered species with unique
//! names, disjoint half-open scalar intervals mapping to a species.
//!
//! Parsing an on-disk range file is an external loader's job, per
//! spec.md's Non-goals; this module only implements the contract a
//! loader would populate (`RangeTable::from_intervals`) and the lookup
//! every other engine needs (`value -> species index | unranged`).

use crate::error::CoreError;
use crate::ion::UNRANGED;

/// A named, colour-tagged species label.
#[derive(Debug, Clone, PartialEq)]
pub struct Species {
    pub name: String,
    /// RGB, 0.0-1.0 per channel, matching the colour-hint fields carried
    /// on streams elsewhere in this crate.
    pub colour: (f32, f32, f32),
}

impl Species {
    pub fn new(name: impl Into<String>, colour: (f32, f32, f32)) -> Self {
        Species { name: name.into(), colour }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Interval {
    lo: f32,
    hi: f32,
    species: usize,
}

/// Ordered species list plus disjoint half-open intervals `[lo, hi)`
/// mapping a scalar mass-to-charge value to a species index.
#[derive(Debug, Clone)]
pub struct RangeTable {
    species: Vec<Species>,
    // Sorted by `lo`, for binary-search lookup.
    intervals: Vec<Interval>,
}

impl RangeTable {
    /// Builds a range table from a species list and a set of
    /// `(lo, hi, species_index)` intervals. Rejects duplicate species
    /// names and overlapping intervals, matching the original loader's
    /// "overlap is an error" contract.
    pub fn from_intervals(
        species: Vec<Species>,
        mut intervals: Vec<(f32, f32, usize)>,
    ) -> Result<Self, CoreError> {
        for i in 0..species.len() {
            for j in (i + 1)..species.len() {
                if species[i].name == species[j].name {
                    return Err(CoreError::DegenerateInput(format!(
                        "duplicate species name: {}",
                        species[i].name
                    )));
                }
            }
        }

        for &(lo, hi, species_idx) in &intervals {
            if !(lo < hi) {
                return Err(CoreError::DegenerateInput(format!(
                    "range interval [{lo}, {hi}) is not a valid half-open interval"
                )));
            }
            if species_idx >= species.len() {
                return Err(CoreError::DegenerateInput(format!(
                    "range interval refers to unknown species index {species_idx}"
                )));
            }
        }

        intervals.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        for w in intervals.windows(2) {
            let (_, hi_a, _) = w[0];
            let (lo_b, _, _) = w[1];
            if hi_a > lo_b {
                return Err(CoreError::DegenerateInput(format!(
                    "overlapping range intervals: ..,{hi_a}) and [{lo_b},.."
                )));
            }
        }

        let intervals = intervals
            .into_iter()
            .map(|(lo, hi, species)| Interval { lo, hi, species })
            .collect();

        Ok(RangeTable { species, intervals })
    }

    pub fn species(&self) -> &[Species] {
        &self.species
    }

    pub fn num_species(&self) -> usize {
        self.species.len()
    }

    /// Maps a scalar value to a species index, or [`UNRANGED`] if no
    /// interval contains it.
    pub fn lookup(&self, value: f32) -> usize {
        // Binary search for the last interval whose `lo <= value`.
        let idx = match self
            .intervals
            .binary_search_by(|iv| iv.lo.partial_cmp(&value).unwrap())
        {
            Ok(i) => i,
            Err(0) => return UNRANGED,
            Err(i) => i - 1,
        };
        let iv = &self.intervals[idx];
        if value >= iv.lo && value < iv.hi {
            iv.species
        } else {
            UNRANGED
        }
    }
}
