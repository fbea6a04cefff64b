use std::io::Write;

use tracing::debug;

use super::topic::{accumulate_topic, topic_conditional, topic_scores};
use super::{intern_item, log_sum_exp, lookup_chain, Decoded, ModelType, SequenceModel};
use crate::dataset::{Document, Sequence};
use crate::error::{clamp_log, Result, LOG_ZERO};
use crate::param::{ModelReader, ParamStore};

/// Maximum-entropy classifier.
///
/// Every token of a document is an independent event: its label depends on
/// its own observations only, so there are no transition parameters.
#[derive(Debug, Clone, Default)]
pub struct MaxEnt {
    store: ParamStore,
    weights: Vec<f64>,
}

impl MaxEnt {
    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    pub fn num_labels(&self) -> usize {
        self.store.num_states()
    }
}

/// Per-event scores and posteriors, `[T][K]` row-major
#[derive(Debug, Clone)]
pub struct EventWorkspace {
    num_labels: usize,
    num_items: usize,
    scores: Vec<f64>,
    probs: Vec<f64>,
    log_z: Vec<f64>,
    log_norm: f64,
}

impl EventWorkspace {
    fn new(num_labels: usize, max_items: usize) -> Self {
        Self {
            num_labels,
            num_items: 0,
            scores: Vec::with_capacity(num_labels * max_items),
            probs: Vec::with_capacity(num_labels * max_items),
            log_z: Vec::with_capacity(max_items),
            log_norm: 0.0,
        }
    }

    fn set_num_items(&mut self, t: usize) {
        self.num_items = t;
        self.scores.clear();
        self.scores.resize(t * self.num_labels, 0.0);
        self.probs.clear();
        self.probs.resize(t * self.num_labels, 0.0);
        self.log_z.clear();
        self.log_z.resize(t, 0.0);
    }

    fn scores(&self, t: usize) -> &[f64] {
        &self.scores[t * self.num_labels..(t + 1) * self.num_labels]
    }

    fn probs(&self, t: usize) -> &[f64] {
        &self.probs[t * self.num_labels..(t + 1) * self.num_labels]
    }

    /// `log Z` of the event at `t`
    pub fn event_log_norm(&self, t: usize) -> f64 {
        self.log_z[t]
    }
}

impl SequenceModel for MaxEnt {
    type Sample = Sequence;
    type Workspace = EventWorkspace;

    const MODEL_TYPE: ModelType = ModelType::MaxEnt;

    fn build(docs: &[Document]) -> Result<(Self, Vec<Sequence>)> {
        let mut model = MaxEnt::default();
        let mut samples = Vec::with_capacity(docs.len());
        for doc in docs {
            let mut seq = Sequence::with_capacity(doc.len());
            for token in &doc.tokens {
                let label = model.store.add_new_state(&token.label)?;
                let item = intern_item(&mut model.store, &token.attrs, label)?;
                seq.push(item, label);
            }
            samples.push(seq);
        }
        Ok((model, samples))
    }

    fn finalize(&mut self, tied: Option<f64>) -> Result<()> {
        self.store.finalize()?;
        if tied.is_some() {
            debug!("maximum-entropy models have no transitions to tie");
        }
        self.weights = vec![0.0; self.store.n_weight()];
        let stats = self.store.stats();
        debug!(
            states = stats.num_states,
            features = stats.num_features,
            params = stats.num_params,
            "finalized MaxEnt"
        );
        Ok(())
    }

    fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn weights_mut(&mut self) -> &mut Vec<f64> {
        &mut self.weights
    }

    fn empirical_counts(&self, out: &mut [f64]) {
        self.store.fill_empirical(out);
    }

    fn materialize_tied(&mut self) -> Result<()> {
        Ok(())
    }

    fn prune_transitions(&mut self, _threshold: f64) -> Result<()> {
        Ok(())
    }

    fn encode(&self, doc: &Document) -> Result<Sequence> {
        Ok(lookup_chain(&self.store, &doc.tokens))
    }

    fn sample_len(sample: &Sequence) -> usize {
        sample.len()
    }

    fn workspace(&self, max_len: usize) -> EventWorkspace {
        EventWorkspace::new(self.store.num_states(), max_len)
    }

    fn calculate_factors(
        &self,
        weights: &[f64],
        sample: &Sequence,
        ws: &mut EventWorkspace,
    ) -> Result<()> {
        let k = ws.num_labels;
        ws.set_num_items(sample.len());
        if k == 0 {
            return Ok(());
        }
        for (item, scores) in sample.items.iter().zip(ws.scores.chunks_exact_mut(k)) {
            topic_scores(&self.store, weights, item, scores);
        }
        Ok(())
    }

    fn forward(&self, ws: &mut EventWorkspace) -> Result<f64> {
        let k = ws.num_labels;
        let mut total = 0.0;
        for t in 0..ws.num_items {
            let lse = log_sum_exp(ws.scores(t));
            ws.log_z[t] = lse;
            total += lse;
            let scores = &ws.scores[t * k..(t + 1) * k];
            let probs = &mut ws.probs[t * k..(t + 1) * k];
            for (p, &s) in probs.iter_mut().zip(scores) {
                *p = if lse.is_finite() { (s - lse).exp() } else { 0.0 };
            }
        }
        ws.log_norm = total;
        Ok(total)
    }

    fn backward(&self, _ws: &mut EventWorkspace) -> Result<()> {
        Ok(())
    }

    fn log_partition(&self, ws: &EventWorkspace) -> f64 {
        ws.log_norm
    }

    fn viterbi_search(&self, ws: &mut EventWorkspace) -> Result<Decoded> {
        let mut labels = Vec::with_capacity(ws.num_items);
        let mut log_prob = 0.0;
        for t in 0..ws.num_items {
            let mut best = 0;
            let mut best_score = f64::NEG_INFINITY;
            for (y, &s) in ws.scores(t).iter().enumerate() {
                if s > best_score {
                    best_score = s;
                    best = y;
                }
            }
            log_prob += best_score - ws.log_z[t];
            labels.push(best as u32);
        }
        Ok(Decoded {
            labels,
            topic: None,
            probability: log_prob.exp(),
        })
    }

    fn log_prob(&self, sample: &Sequence, ws: &EventWorkspace) -> f64 {
        if sample.labels.len() != sample.len() {
            return LOG_ZERO;
        }
        let score: f64 = sample
            .labels
            .iter()
            .enumerate()
            .map(|(t, &y)| ws.scores(t)[y as usize])
            .sum();
        clamp_log(score - ws.log_norm)
    }

    fn gradient_contribution(
        &self,
        sample: &Sequence,
        ws: &mut EventWorkspace,
        grad: &mut [f64],
        factor: f64,
    ) -> Result<()> {
        for (t, item) in sample.items.iter().enumerate() {
            accumulate_topic(&self.store, item, ws.probs(t), grad, factor);
        }
        Ok(())
    }

    fn marginal(&self, ws: &EventWorkspace, t: usize, label: u32) -> f64 {
        ws.probs(t).get(label as usize).copied().unwrap_or(0.0)
    }

    /// Events are independent, so the pseudo-likelihood is the likelihood
    fn pseudo_log_likelihood(
        &self,
        weights: &[f64],
        sample: &Sequence,
        _ws: &mut EventWorkspace,
        grad: &mut [f64],
    ) -> Result<f64> {
        let mut scores = vec![0.0; self.store.num_states()];
        let mut diff = Vec::with_capacity(scores.len());
        let mut total = 0.0;
        for (item, &y) in sample.items.iter().zip(&sample.labels) {
            topic_scores(&self.store, weights, item, &mut scores);
            total += clamp_log(topic_conditional(&scores, y as usize, &mut diff));
            accumulate_topic(&self.store, item, &diff, grad, 1.0);
        }
        Ok(total)
    }

    fn label_name(&self, id: u32) -> Option<&str> {
        self.store.states().name(id)
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.store.write_to(&self.weights, writer)
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut reader = ModelReader::new(bytes);
        let (store, weights) = reader.read_store()?;
        reader.finish()?;
        Ok(MaxEnt { store, weights })
    }
}
