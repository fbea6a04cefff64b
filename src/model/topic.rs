//! Topic layer shared by the triangular models: one chain lattice per topic
//! combined through the topic prior.

use super::log_sum_exp;
use crate::context::ChainContext;
use crate::dataset::Item;
use crate::param::ParamStore;

/// Per-topic lattices and the combined normaliser of a triangular model
#[derive(Debug, Clone)]
pub struct TopicWorkspace {
    pub(crate) chains: Vec<ChainContext>,
    /// `log Γ(z)`: unnormalised topic scores
    pub(crate) log_prior: Vec<f64>,
    /// `log Z_z`: normaliser of the chain under topic `z`
    pub(crate) log_z: Vec<f64>,
    pub(crate) posterior: Vec<f64>,
    pub(crate) log_norm: f64,
}

impl TopicWorkspace {
    pub(crate) fn new(chains: Vec<ChainContext>) -> Self {
        let n = chains.len();
        Self {
            chains,
            log_prior: vec![0.0; n],
            log_z: vec![0.0; n],
            posterior: vec![0.0; n],
            log_norm: 0.0,
        }
    }

    pub fn num_topics(&self) -> usize {
        self.chains.len()
    }

    /// Lattice of topic `z`
    pub fn chain(&self, z: usize) -> &ChainContext {
        &self.chains[z]
    }

    pub fn log_prior(&self) -> &[f64] {
        &self.log_prior
    }

    /// `P(z | x)` after the last forward pass
    pub fn posterior(&self) -> &[f64] {
        &self.posterior
    }

    pub fn log_norm(&self) -> f64 {
        self.log_norm
    }

    /// Combine the per-topic normalisers into `log Z` and the topic
    /// posterior.
    pub(crate) fn combine(&mut self) -> f64 {
        let joint: Vec<f64> = self
            .log_prior
            .iter()
            .zip(&self.log_z)
            .map(|(p, z)| p + z)
            .collect();
        self.log_norm = log_sum_exp(&joint);
        for (post, &j) in self.posterior.iter_mut().zip(&joint) {
            *post = if self.log_norm.is_finite() {
                (j - self.log_norm).exp()
            } else {
                0.0
            };
        }
        self.log_norm
    }

    /// Best `(topic, path)` pair among the topics whose prior is within
    /// `prune` of the best prior. Returns the topic, its local label path
    /// and the joint probability. Ties go to the lowest topic id.
    pub(crate) fn decode(&mut self, prune: f64) -> Option<(u32, Vec<u32>, f64)> {
        let best_prior = self
            .log_prior
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let mut best: Option<(u32, Vec<u32>, f64)> = None;
        for (z, chain) in self.chains.iter_mut().enumerate() {
            let prior = self.log_prior[z];
            if prior < best_prior - prune {
                continue;
            }
            let (labels, score) = chain.viterbi();
            let total = prior + score;
            if best.as_ref().map_or(true, |b| total > b.2) {
                best = Some((z as u32, labels, total));
            }
        }
        let log_norm = self.log_norm;
        best.map(|(z, labels, total)| (z, labels, (total - log_norm).exp()))
    }
}

/// Topic scores `log Γ(z)` of the topic observations
pub(crate) fn topic_scores(store: &ParamStore, weights: &[f64], obs: &Item, out: &mut [f64]) {
    out.iter_mut().for_each(|v| *v = 0.0);
    for o in obs {
        for param in store.params(o.id) {
            out[param.label as usize] += weights[param.slot as usize] * o.value;
        }
    }
}

/// Add `factor * probs[z] * value` for every topic observation parameter
pub(crate) fn accumulate_topic(
    store: &ParamStore,
    obs: &Item,
    probs: &[f64],
    grad: &mut [f64],
    factor: f64,
) {
    for o in obs {
        for param in store.params(o.id) {
            grad[param.slot as usize] += factor * probs[param.label as usize] * o.value;
        }
    }
}

/// Topic conditional `P(z | y, x)` from per-topic joint scores.
///
/// Returns `log P(gold | y, x)` and writes `P(z | y, x) - [z == gold]` to
/// `diff`.
pub(crate) fn topic_conditional(scores: &[f64], gold: usize, diff: &mut Vec<f64>) -> f64 {
    let lse = log_sum_exp(scores);
    diff.clear();
    diff.extend(scores.iter().enumerate().map(|(z, &s)| {
        let p = if lse.is_finite() { (s - lse).exp() } else { 0.0 };
        p - if z == gold { 1.0 } else { 0.0 }
    }));
    scores[gold] - lse
}
