//! Sparse feature/parameter store.
//!
//! A store maps `(observation feature, label)` pairs to dense weight slots.
//! Transitions are ordinary parameters of reserved previous-label features
//! named `"@" + label`, so a single index serves both node and edge weights.

mod edge;
mod io;

use tracing::debug;

use crate::dictionary::Dictionary;
use crate::error::{Error, Result};

pub use self::edge::{Edge, EdgeIndex, EdgeSelection};
pub(crate) use self::io::ModelReader;

/// Prefix of the previous-label pseudo-features
pub(crate) const EDGE_PREFIX: &str = "@";
/// Name of the tied-potential remainder feature
pub(crate) const REMAINDER_FEATURE: &str = "@REMAIN@";
/// Name of the state used for unknown labels when present
pub(crate) const OUTSIDE_STATE: &str = "O";

/// One entry of the parameter index: the slot holding the weight of
/// `(feature, label)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Param {
    pub label: u32,
    pub slot: u32,
}

/// Summary numbers reported after building or loading a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub num_states: usize,
    pub num_features: usize,
    pub num_params: usize,
}

/// Feature/parameter store of one log-linear factor family
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    features: Dictionary,
    states: Dictionary,
    /// Per feature id, the sorted list of `(label, slot)` pairs
    params: Vec<Vec<Param>>,
    /// Empirical counts, indexed by slot
    count: Vec<f64>,
    finalized: bool,
    edges: Option<EdgeIndex>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a finalized store from a parsed model file
    pub(crate) fn from_parts(
        states: Dictionary,
        features: Dictionary,
        params: Vec<Vec<Param>>,
        n_weight: usize,
    ) -> Self {
        let mut states = states;
        let mut features = features;
        states.seal();
        features.seal();
        Self {
            features,
            states,
            params,
            count: vec![0.0; n_weight],
            finalized: true,
            edges: None,
        }
    }

    /// Number of weight slots
    pub fn n_weight(&self) -> usize {
        self.count.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn states(&self) -> &Dictionary {
        &self.states
    }

    pub fn features(&self) -> &Dictionary {
        &self.features
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Intern a label name.
    ///
    /// A label whose previous-label feature would be the remainder feature
    /// is rejected.
    pub fn add_new_state(&mut self, name: &str) -> Result<u32> {
        if REMAINDER_FEATURE.strip_prefix(EDGE_PREFIX) == Some(name) {
            return Err(Error::invalid(format!("label '{}' is reserved", name)));
        }
        self.states.get_or_insert(name)
    }

    /// Intern an observation feature name
    pub fn add_new_observation(&mut self, name: &str) -> Result<u32> {
        let id = self.features.get_or_insert(name)?;
        if self.params.len() <= id as usize {
            self.params.resize(id as usize + 1, Vec::new());
        }
        Ok(id)
    }

    pub fn find_state(&self, name: &str) -> Option<u32> {
        self.states.get(name)
    }

    pub fn find_observation(&self, name: &str) -> Option<u32> {
        self.features.get(name)
    }

    /// The state substituted for labels unknown to this store
    pub fn default_state(&self) -> u32 {
        self.states.get(OUTSIDE_STATE).unwrap_or(0)
    }

    /// Intern the previous-label pseudo-feature of `label`
    pub fn add_edge_feature(&mut self, label: u32) -> Result<u32> {
        let name = self.edge_feature_name(label)?;
        self.add_new_observation(&name)
    }

    /// Look up the previous-label pseudo-feature of `label`
    pub fn find_edge_feature(&self, label: u32) -> Option<u32> {
        let name = self.edge_feature_name(label).ok()?;
        self.features.get(&name)
    }

    fn edge_feature_name(&self, label: u32) -> Result<String> {
        let name = self
            .states
            .name(label)
            .ok_or_else(|| Error::invalid(format!("unknown state id {}", label)))?;
        Ok(format!("{}{}", EDGE_PREFIX, name))
    }

    /// Register `(feature, label)` or accumulate into its existing slot.
    ///
    /// Returns the slot id. The empirical count of the slot grows by `fval`.
    pub fn update_param(&mut self, label: u32, feature: u32, fval: f64) -> Result<u32> {
        if self.finalized {
            return Err(Error::invalid("parameter store is finalized"));
        }
        if label as usize >= self.states.len() {
            return Err(Error::invalid(format!("unknown state id {}", label)));
        }
        if feature as usize >= self.features.len() {
            return Err(Error::invalid(format!("unknown feature id {}", feature)));
        }
        if self.params.len() < self.features.len() {
            self.params.resize(self.features.len(), Vec::new());
        }
        self.edges = None;
        Ok(self.insert_param(label, feature, fval))
    }

    fn insert_param(&mut self, label: u32, feature: u32, fval: f64) -> u32 {
        let list = &mut self.params[feature as usize];
        match list.binary_search_by_key(&label, |p| p.label) {
            Ok(pos) => {
                let slot = list[pos].slot;
                self.count[slot as usize] += fval;
                slot
            }
            Err(pos) => {
                let slot = self.count.len() as u32;
                list.insert(pos, Param { label, slot });
                self.count.push(fval);
                slot
            }
        }
    }

    /// Renumber slots contiguously in feature-major, label-minor order and
    /// seal both dictionaries.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(Error::invalid("parameter store is already finalized"));
        }
        self.params.resize(self.features.len(), Vec::new());
        let mut count = vec![0.0; self.count.len()];
        let mut next = 0u32;
        for list in &mut self.params {
            for param in list.iter_mut() {
                count[next as usize] = self.count[param.slot as usize];
                param.slot = next;
                next += 1;
            }
        }
        debug_assert_eq!(next as usize, self.count.len());
        self.count = count;
        self.features.seal();
        self.states.seal();
        self.finalized = true;
        self.edges = None;
        debug!(
            states = self.states.len(),
            features = self.features.len(),
            params = self.count.len(),
            "parameter store finalized"
        );
        Ok(())
    }

    /// Parameters attached to a feature id
    pub fn params(&self, feature: u32) -> &[Param] {
        self.params
            .get(feature as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Slot of `(feature, label)` if it exists
    pub fn slot(&self, feature: u32, label: u32) -> Option<u32> {
        let list = self.params(feature);
        list.binary_search_by_key(&label, |p| p.label)
            .ok()
            .map(|pos| list[pos].slot)
    }

    /// Empirical counts indexed by slot
    pub fn counts(&self) -> &[f64] {
        &self.count
    }

    /// Write the empirical feature counts used by the likelihood gradient.
    ///
    /// Tied remainder slots hold an averaged count; the gradient needs the
    /// pre-fold sum, which is restored here.
    pub fn fill_empirical(&self, out: &mut [f64]) {
        out.copy_from_slice(&self.count);
        if let Some(edges) = &self.edges {
            for (slot, folded) in edges.remainder_folds() {
                out[slot as usize] *= folded as f64;
            }
        }
    }

    /// The current edge index
    pub fn edge_index(&self) -> Result<&EdgeIndex> {
        self.edges.as_ref().ok_or(Error::StaleIndex)
    }

    /// Drop the edge index, forcing a rebuild before the next inference
    pub fn invalidate_edge_index(&mut self) {
        self.edges = None;
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            num_states: self.states.len(),
            num_features: self.features.len(),
            num_params: self.count.len(),
        }
    }

    pub(crate) fn raw_params(&self) -> &[Vec<Param>] {
        &self.params
    }

    /// Slots of the remainder feature keyed by predecessor label
    fn remainder_slots(&self) -> Vec<Option<u32>> {
        let mut slots = vec![None; self.states.len()];
        if let Some(fid) = self.features.get(REMAINDER_FEATURE) {
            for param in self.params(fid) {
                slots[param.label as usize] = Some(param.slot);
            }
        }
        slots
    }

    /// Add the remainder feature with one slot per label, returning how many
    /// slots were appended.
    fn ensure_remainder_feature(&mut self) -> usize {
        let before = self.count.len();
        let fid = self.features.insert_reserved(REMAINDER_FEATURE);
        if self.params.len() <= fid as usize {
            self.params.resize(fid as usize + 1, Vec::new());
        }
        for label in 0..self.states.len() as u32 {
            self.insert_param(label, fid, 0.0);
        }
        self.count.len() - before
    }
}
