//! Per-node output cache, per spec.md §6.1/§7.1's lifecycle rules:
//! outputs are built inside `refresh`, optionally retained, and
//! invalidated whenever a parameter affecting their producer changes or
//! the caller explicitly purges. Not persisted across process
//! invocations (spec.md §1 Non-goals).

use crate::stream::FilterStreamData;

/// A fingerprint of the parameters that produced a cached result.
/// Recomputed by the caller from its own parameter struct (typically
/// via `format!("{:?}", params)` on a `Debug`-deriving params type, or a
/// hash of one) and compared on each `refresh` to decide whether the
/// cache is still valid.
pub type ParamFingerprint = u64;

#[derive(Debug, Default)]
pub struct NodeCache {
    fingerprint: Option<ParamFingerprint>,
    streams: Vec<FilterStreamData>,
}

impl NodeCache {
    pub fn new() -> Self {
        NodeCache::default()
    }

    /// Returns the cached streams if `fingerprint` matches what produced
    /// them; otherwise `None`, signalling the caller must recompute.
    pub fn get(&self, fingerprint: ParamFingerprint) -> Option<&[FilterStreamData]> {
        if self.fingerprint == Some(fingerprint) {
            Some(&self.streams)
        } else {
            None
        }
    }

    pub fn is_valid(&self, fingerprint: ParamFingerprint) -> bool {
        self.fingerprint == Some(fingerprint)
    }

    /// Replaces the cache contents, tagging them with the fingerprint
    /// that produced them.
    pub fn store(&mut self, fingerprint: ParamFingerprint, streams: Vec<FilterStreamData>) {
        self.fingerprint = Some(fingerprint);
        self.streams = streams;
    }

    /// Drops cached streams without recomputing, per the user-requested
    /// purge path in spec.md §6.1. A subsequent `refresh` on any
    /// downstream consumer forces recomputation of this node, but an
    /// error encountered while recomputing a *sibling* leaves this
    /// node's cache intact (spec.md §7 error policy) -- callers should
    /// only invalidate a node whose own parameters changed, not every
    /// node in the graph.
    pub fn invalidate(&mut self) {
        self.fingerprint = None;
        self.streams.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
