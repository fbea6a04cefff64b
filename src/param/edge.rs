use tracing::debug;

use super::ParamStore;
use crate::error::{Error, Result};

/// A transition with its own weight slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub prev: u32,
    pub next: u32,
    pub slot: u32,
}

/// How the individually weighted transitions of an [`EdgeIndex`] were chosen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeSelection {
    /// Every attested transition
    Full,
    /// Transitions whose potential differs from the default by more than
    /// `threshold`
    Active { threshold: f64 },
    /// Transitions seen at least `min_count` times; the rest share one
    /// remainder weight per predecessor label
    Tied { min_count: f64 },
}

/// Sparse view of the transition parameters used by inference.
///
/// A transition `(i, j)` that is not listed has the default weight of its
/// predecessor `i`: the remainder slot when one exists, zero otherwise.
#[derive(Debug, Clone)]
pub struct EdgeIndex {
    num_labels: usize,
    selection: EdgeSelection,
    backpointers: bool,
    attested: Vec<Edge>,
    selected: Vec<Edge>,
    /// Per successor label, `(prev, slot)` sorted by `prev`
    into: Vec<Vec<(u32, u32)>>,
    /// Per predecessor label, `(next, slot)` sorted by `next`
    from: Vec<Vec<(u32, u32)>>,
    remainder: Vec<Option<u32>>,
    /// Per predecessor label, how many transitions were folded into the
    /// remainder slot
    folded: Vec<u32>,
}

impl EdgeIndex {
    fn new(
        num_labels: usize,
        selection: EdgeSelection,
        backpointers: bool,
        attested: Vec<Edge>,
        selected: Vec<Edge>,
        remainder: Vec<Option<u32>>,
        folded: Vec<u32>,
    ) -> Self {
        let mut into = vec![Vec::new(); num_labels];
        let mut from = vec![Vec::new(); num_labels];
        for edge in &selected {
            into[edge.next as usize].push((edge.prev, edge.slot));
            from[edge.prev as usize].push((edge.next, edge.slot));
        }
        for list in into.iter_mut().chain(from.iter_mut()) {
            list.sort_unstable();
        }
        Self {
            num_labels,
            selection,
            backpointers,
            attested,
            selected,
            into,
            from,
            remainder,
            folded,
        }
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn selection(&self) -> EdgeSelection {
        self.selection
    }

    /// Whether inference may use the sparse per-successor recursion
    pub fn has_backpointers(&self) -> bool {
        self.backpointers
    }

    /// Individually weighted transitions
    pub fn edges(&self) -> &[Edge] {
        &self.selected
    }

    /// Every transition with a parameter in the store
    pub fn attested(&self) -> &[Edge] {
        &self.attested
    }

    /// Listed predecessors of `next`
    pub fn into(&self, next: u32) -> &[(u32, u32)] {
        &self.into[next as usize]
    }

    /// Listed successors of `prev`
    pub fn from(&self, prev: u32) -> &[(u32, u32)] {
        &self.from[prev as usize]
    }

    /// Remainder slot of a predecessor label
    pub fn remainder(&self, prev: u32) -> Option<u32> {
        self.remainder.get(prev as usize).copied().flatten()
    }

    /// Slot carrying the weight of transition `(prev, next)`
    pub fn slot(&self, prev: u32, next: u32) -> Option<u32> {
        let list = self.from(prev);
        match list.binary_search_by_key(&next, |&(n, _)| n) {
            Ok(pos) => Some(list[pos].1),
            Err(_) => self.remainder(prev),
        }
    }

    /// Weight of transition `(prev, next)` under `weights`
    pub fn transition_weight(&self, weights: &[f64], prev: u32, next: u32) -> f64 {
        self.slot(prev, next)
            .map(|s| weights[s as usize])
            .unwrap_or(0.0)
    }

    /// Weight shared by every unlisted successor of `prev`
    pub fn default_weight(&self, weights: &[f64], prev: u32) -> f64 {
        self.remainder(prev)
            .map(|s| weights[s as usize])
            .unwrap_or(0.0)
    }

    /// Number of transitions folded into the remainder of `prev`
    pub fn folded(&self, prev: u32) -> u32 {
        self.folded.get(prev as usize).copied().unwrap_or(0)
    }

    /// `(remainder slot, folded count)` of every predecessor with folded
    /// transitions
    pub fn remainder_folds(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.remainder
            .iter()
            .zip(self.folded.iter())
            .filter_map(|(slot, &n)| match slot {
                Some(slot) if n > 0 => Some((*slot, n)),
                _ => None,
            })
    }
}

impl ParamStore {
    fn attested_edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for prev in 0..self.states.len() as u32 {
            if let Some(fid) = self.find_edge_feature(prev) {
                edges.extend(self.params(fid).iter().map(|p| Edge {
                    prev,
                    next: p.label,
                    slot: p.slot,
                }));
            }
        }
        edges
    }

    /// Index every attested transition.
    ///
    /// A remainder feature present in the store (a model trained with tied
    /// potentials) provides the default weights.
    pub fn build_edge_index(&mut self, backpointers: bool) -> Result<()> {
        let attested = self.attested_edges();
        let num_labels = self.states.len();
        let index = EdgeIndex::new(
            num_labels,
            EdgeSelection::Full,
            backpointers,
            attested.clone(),
            attested,
            self.remainder_slots(),
            vec![0; num_labels],
        );
        debug!(edges = index.edges().len(), "built full edge index");
        self.edges = Some(index);
        Ok(())
    }

    /// Index only the transitions whose potential `exp(w)` differs from the
    /// default potential by more than `threshold`
    pub fn build_active_index(&mut self, weights: &[f64], threshold: f64) -> Result<()> {
        if weights.len() != self.n_weight() {
            return Err(Error::invalid(format!(
                "expected {} weights, got {}",
                self.n_weight(),
                weights.len()
            )));
        }
        if !(threshold >= 0.0) {
            return Err(Error::invalid("threshold must be non-negative"));
        }
        let remainder = self.remainder_slots();
        let attested = self.attested_edges();
        let selected: Vec<Edge> = attested
            .iter()
            .copied()
            .filter(|e| {
                let default = remainder[e.prev as usize]
                    .map(|s| weights[s as usize])
                    .unwrap_or(0.0);
                (weights[e.slot as usize].exp() - default.exp()).abs() > threshold
            })
            .collect();
        let num_labels = self.states.len();
        debug!(
            attested = attested.len(),
            active = selected.len(),
            threshold,
            "built active edge index"
        );
        self.edges = Some(EdgeIndex::new(
            num_labels,
            EdgeSelection::Active { threshold },
            true,
            attested,
            selected,
            remainder,
            vec![0; num_labels],
        ));
        Ok(())
    }

    /// Keep transitions observed at least `min_count` times and fold the
    /// rest into one remainder parameter per predecessor label.
    ///
    /// The remainder count is the average of the folded counts and the
    /// folded counts are zeroed. Returns the number of weight slots appended
    /// to the store.
    pub fn build_tied_index(&mut self, min_count: f64) -> Result<usize> {
        if !self.finalized {
            return Err(Error::invalid("tied index requires a finalized store"));
        }
        if !(min_count >= 0.0) {
            return Err(Error::invalid("min_count must be non-negative"));
        }
        if let Some(edges) = &self.edges {
            if matches!(edges.selection(), EdgeSelection::Tied { .. }) {
                return Err(Error::invalid("tied index already built"));
            }
        }
        let appended = self.ensure_remainder_feature();
        let remainder = self.remainder_slots();
        let attested = self.attested_edges();
        let num_labels = self.states.len();

        let mut folded = vec![0u32; num_labels];
        let mut sums = vec![0.0; num_labels];
        let mut selected = Vec::with_capacity(attested.len());
        for edge in &attested {
            let count = &mut self.count[edge.slot as usize];
            if *count < min_count {
                sums[edge.prev as usize] += *count;
                folded[edge.prev as usize] += 1;
                *count = 0.0;
            } else {
                selected.push(*edge);
            }
        }
        for (prev, slot) in remainder.iter().enumerate() {
            if let Some(slot) = slot {
                self.count[*slot as usize] = if folded[prev] > 0 {
                    sums[prev] / folded[prev] as f64
                } else {
                    0.0
                };
            }
        }
        debug!(
            attested = attested.len(),
            kept = selected.len(),
            min_count,
            "built tied edge index"
        );
        self.edges = Some(EdgeIndex::new(
            num_labels,
            EdgeSelection::Tied { min_count },
            true,
            attested,
            selected,
            remainder,
            folded,
        ));
        Ok(appended)
    }

    /// Copy each remainder weight into the slots of the transitions folded
    /// into it, so a plain full index reproduces the tied potentials.
    pub fn materialize_tied(&self, weights: &mut [f64]) -> Result<()> {
        let index = self.edge_index()?;
        if weights.len() != self.n_weight() {
            return Err(Error::invalid(format!(
                "expected {} weights, got {}",
                self.n_weight(),
                weights.len()
            )));
        }
        let mut listed = vec![false; self.n_weight()];
        for edge in index.edges() {
            listed[edge.slot as usize] = true;
        }
        for edge in index.attested() {
            if listed[edge.slot as usize] {
                continue;
            }
            if let Some(r) = index.remainder(edge.prev) {
                weights[edge.slot as usize] = weights[r as usize];
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three labels with transition counts
    /// a->a 5, a->b 1, a->c 2, b->a 3, c->c 1
    fn chain_store() -> ParamStore {
        let mut store = ParamStore::new();
        for name in ["a", "b", "c"] {
            store.add_new_state(name).unwrap();
        }
        let obs = store.add_new_observation("w").unwrap();
        store.update_param(0, obs, 1.0).unwrap();
        let counts = [(0, 0, 5.0), (0, 1, 1.0), (0, 2, 2.0), (1, 0, 3.0), (2, 2, 1.0)];
        for (prev, next, n) in counts {
            let f = store.add_edge_feature(prev).unwrap();
            store.update_param(next, f, n).unwrap();
        }
        store.finalize().unwrap();
        store
    }

    #[test]
    fn test_full_index() {
        let mut store = chain_store();
        store.build_edge_index(true).unwrap();
        let index = store.edge_index().unwrap();
        assert_eq!(index.edges().len(), 5);
        assert_eq!(index.from(0).len(), 3);
        assert_eq!(index.into(2).len(), 2);
        assert!(index.slot(0, 1).is_some());
        // unattested with no remainder
        assert_eq!(index.slot(1, 2), None);
        let weights = vec![0.5; store.n_weight()];
        assert_eq!(index.transition_weight(&weights, 1, 2), 0.0);
        assert_eq!(index.transition_weight(&weights, 1, 0), 0.5);
    }

    #[test]
    fn test_active_index_filters_small_potentials() {
        let mut store = chain_store();
        let mut weights = vec![0.0; store.n_weight()];
        let big = store
            .find_edge_feature(0)
            .and_then(|f| store.slot(f, 1))
            .unwrap();
        weights[big as usize] = 2.0;
        store.build_active_index(&weights, 0.1).unwrap();
        let index = store.edge_index().unwrap();
        assert_eq!(index.edges().len(), 1);
        assert_eq!(index.edges()[0].slot, big);
        assert!(matches!(index.selection(), EdgeSelection::Active { .. }));
        assert!(store.build_active_index(&weights[1..], 0.1).is_err());
    }

    #[test]
    fn test_tied_index_conserves_counts() {
        let mut store = chain_store();
        let before = store.counts().to_vec();
        let n_before = store.n_weight();
        let appended = store.build_tied_index(3.0).unwrap();
        assert_eq!(appended, 3);
        assert_eq!(store.n_weight(), n_before + 3);

        let index = store.edge_index().unwrap().clone();
        // a->a and b->a survive
        assert_eq!(index.edges().len(), 2);
        for prev in 0..3u32 {
            let folded_sum: f64 = index
                .attested()
                .iter()
                .filter(|e| e.prev == prev && !index.edges().contains(e))
                .map(|e| before[e.slot as usize])
                .sum();
            let r = index.remainder(prev).unwrap() as usize;
            let restored = store.counts()[r] * index.folded(prev) as f64;
            assert!((restored - folded_sum).abs() < 1e-12);
        }
        assert_eq!(index.folded(0), 2);
        assert_eq!(store.counts()[index.remainder(0).unwrap() as usize], 1.5);

        let mut empirical = vec![0.0; store.n_weight()];
        store.fill_empirical(&mut empirical);
        assert_eq!(empirical[index.remainder(0).unwrap() as usize], 3.0);

        assert!(store.build_tied_index(3.0).is_err());
    }

    #[test]
    fn test_materialize_tied() {
        let mut store = chain_store();
        store.build_tied_index(3.0).unwrap();
        let mut weights = vec![0.0; store.n_weight()];
        let index = store.edge_index().unwrap().clone();
        let r0 = index.remainder(0).unwrap();
        weights[r0 as usize] = -0.75;
        let tied_ab = index.transition_weight(&weights, 0, 1);
        assert_eq!(tied_ab, -0.75);

        store.materialize_tied(&mut weights).unwrap();
        store.build_edge_index(true).unwrap();
        let full = store.edge_index().unwrap();
        for prev in 0..3 {
            for next in 0..3 {
                assert_eq!(
                    full.transition_weight(&weights, prev, next),
                    index.transition_weight(&weights, prev, next),
                );
            }
        }
    }
}
