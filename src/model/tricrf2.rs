use std::io::Write;

use tracing::debug;

use super::topic::{accumulate_topic, topic_conditional, topic_scores, TopicWorkspace};
use super::{
    accumulate_states, chain_pseudo_likelihood, fill_state_scores, intern_chain, intern_item,
    lookup_chain, lookup_item, Decoded, ModelType, SequenceModel,
};
use crate::context::{ChainContext, Flag};
use crate::dataset::{Document, Item, Sequence};
use crate::error::{clamp_log, Error, Result, LOG_ZERO};
use crate::param::{ModelReader, ParamStore, EDGE_PREFIX};

/// A document encoded for [`TriCrf2`]
#[derive(Debug, Clone, Default)]
pub struct TriCrf2Sample {
    pub(crate) topic_obs: Item,
    pub(crate) topic: Option<u32>,
    pub(crate) seq: Sequence,
}

/// Triangular-chain CRF with one shared sequence model.
///
/// The topic store carries, besides the topic observations, one
/// pseudo-feature `@<label>` per label whose weight under topic `z` is the
/// compatibility `ψ(z, y)`. A label never seen with a topic is forbidden
/// under it. The weight arena holds the topic store, then the sequence
/// store.
#[derive(Debug, Clone)]
pub struct TriCrf2 {
    topic: ParamStore,
    seq: ParamStore,
    /// Per label, its compatibility feature in the topic store
    psi: Vec<Option<u32>>,
    /// `allowed[z][y]`
    allowed: Vec<Vec<bool>>,
    weights: Vec<f64>,
    prune: f64,
}

impl Default for TriCrf2 {
    fn default() -> Self {
        Self {
            topic: ParamStore::new(),
            seq: ParamStore::new(),
            psi: Vec::new(),
            allowed: Vec::new(),
            weights: Vec::new(),
            prune: f64::INFINITY,
        }
    }
}

impl TriCrf2 {
    pub fn num_topics(&self) -> usize {
        self.topic.num_states()
    }

    pub fn num_labels(&self) -> usize {
        self.seq.num_states()
    }

    pub fn topic_store(&self) -> &ParamStore {
        &self.topic
    }

    pub fn sequence_store(&self) -> &ParamStore {
        &self.seq
    }

    /// Whether label `y` may occur under topic `z`
    pub fn is_allowed(&self, z: u32, y: u32) -> bool {
        self.allowed
            .get(z as usize)
            .and_then(|row| row.get(y as usize))
            .copied()
            .unwrap_or(false)
    }

    /// Slot of `ψ(z, y)` in the topic store
    fn psi_slot(&self, z: u32, y: u32) -> Option<u32> {
        let fid = self.psi.get(y as usize).copied().flatten()?;
        self.topic.slot(fid, z)
    }

    fn psi_name(&self, y: u32) -> Result<String> {
        let name = self
            .seq
            .states()
            .name(y)
            .ok_or_else(|| Error::invalid(format!("unknown label id {}", y)))?;
        Ok(format!("{}{}", EDGE_PREFIX, name))
    }

    fn rebuild_compatibility(&mut self) -> Result<()> {
        self.psi = (0..self.num_labels() as u32)
            .map(|y| Ok(self.topic.find_observation(&self.psi_name(y)?)))
            .collect::<Result<Vec<_>>>()?;
        self.allowed = (0..self.num_topics() as u32)
            .map(|z| {
                (0..self.num_labels() as u32)
                    .map(|y| self.psi_slot(z, y).is_some())
                    .collect()
            })
            .collect();
        Ok(())
    }

    /// Per-label score offset under topic `z`: `ψ(z, y)`, or `-inf` for a
    /// forbidden label
    fn label_bias(&self, topic_weights: &[f64], z: u32) -> Vec<f64> {
        (0..self.num_labels() as u32)
            .map(|y| match self.psi_slot(z, y) {
                Some(slot) => topic_weights[slot as usize],
                None => f64::NEG_INFINITY,
            })
            .collect()
    }
}

impl SequenceModel for TriCrf2 {
    type Sample = TriCrf2Sample;
    type Workspace = TopicWorkspace;

    const MODEL_TYPE: ModelType = ModelType::TriCrf2;

    fn build(docs: &[Document]) -> Result<(Self, Vec<TriCrf2Sample>)> {
        let mut model = TriCrf2::default();
        for doc in docs {
            let event = doc.topic.as_ref().ok_or_else(|| {
                Error::invalid("triangular models need a topic for every training sequence")
            })?;
            let z = model.topic.add_new_state(&event.label)?;
            intern_item(&mut model.topic, &event.attrs, z)?;
            let seq = intern_chain(&mut model.seq, &doc.tokens)?;
            for &y in &seq.labels {
                let fid = model.topic.add_new_observation(&model.psi_name(y)?)?;
                model.topic.update_param(z, fid, 1.0)?;
            }
        }
        model.rebuild_compatibility()?;
        let samples = docs
            .iter()
            .map(|doc| model.encode(doc))
            .collect::<Result<Vec<_>>>()?;
        Ok((model, samples))
    }

    fn finalize(&mut self, tied: Option<f64>) -> Result<()> {
        self.topic.finalize()?;
        self.seq.finalize()?;
        match tied {
            Some(min_count) => {
                self.seq.build_tied_index(min_count)?;
            }
            None => self.seq.build_edge_index(true)?,
        }
        self.rebuild_compatibility()?;
        self.weights = vec![0.0; self.topic.n_weight() + self.seq.n_weight()];
        debug!(
            topics = self.num_topics(),
            labels = self.num_labels(),
            weights = self.weights.len(),
            "finalized TriCRF2"
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
        let (topic, seq) = out.split_at_mut(self.topic.n_weight());
        self.topic.fill_empirical(topic);
        self.seq.fill_empirical(seq);
    }

    fn materialize_tied(&mut self) -> Result<()> {
        let nt = self.topic.n_weight();
        self.seq.materialize_tied(&mut self.weights[nt..])
    }

    fn prune_transitions(&mut self, threshold: f64) -> Result<()> {
        let nt = self.topic.n_weight();
        self.seq.build_active_index(&self.weights[nt..], threshold)
    }

    fn set_topic_prune(&mut self, threshold: f64) {
        self.prune = threshold;
    }

    fn encode(&self, doc: &Document) -> Result<TriCrf2Sample> {
        let (topic_obs, topic) = match &doc.topic {
            Some(event) => (
                lookup_item(&self.topic, &event.attrs),
                self.topic.find_state(&event.label),
            ),
            None => (Item::new(), None),
        };
        Ok(TriCrf2Sample {
            topic_obs,
            topic,
            seq: lookup_chain(&self.seq, &doc.tokens),
        })
    }

    fn sample_len(sample: &TriCrf2Sample) -> usize {
        sample.seq.len()
    }

    fn workspace(&self, max_len: usize) -> TopicWorkspace {
        let k = self.num_labels();
        TopicWorkspace::new(
            (0..self.num_topics())
                .map(|_| ChainContext::new(Flag::ALL, k, max_len))
                .collect(),
        )
    }

    fn calculate_factors(
        &self,
        weights: &[f64],
        sample: &TriCrf2Sample,
        ws: &mut TopicWorkspace,
    ) -> Result<()> {
        let (wt, wseq) = weights.split_at(self.topic.n_weight());
        let edges = self.seq.edge_index()?;
        topic_scores(&self.topic, wt, &sample.topic_obs, &mut ws.log_prior);
        let t_len = sample.seq.len();
        for (z, ctx) in ws.chains.iter_mut().enumerate() {
            let bias = self.label_bias(wt, z as u32);
            ctx.set_num_items(t_len);
            fill_state_scores(ctx, &self.seq, wseq, &sample.seq.items);
            for t in 0..t_len {
                for (y, &b) in bias.iter().enumerate() {
                    ctx.state[[t, y]] += b;
                }
            }
            ctx.set_transitions(edges, wseq);
            ctx.exp_factors();
        }
        Ok(())
    }

    fn forward(&self, ws: &mut TopicWorkspace) -> Result<f64> {
        let edges = self.seq.edge_index()?;
        for z in 0..ws.chains.len() {
            ws.log_z[z] = ws.chains[z].forward(edges);
        }
        Ok(ws.combine())
    }

    fn backward(&self, ws: &mut TopicWorkspace) -> Result<()> {
        let edges = self.seq.edge_index()?;
        for ctx in &mut ws.chains {
            ctx.backward(edges);
        }
        Ok(())
    }

    fn log_partition(&self, ws: &TopicWorkspace) -> f64 {
        ws.log_norm
    }

    fn viterbi_search(&self, ws: &mut TopicWorkspace) -> Result<Decoded> {
        let (z, labels, probability) = ws
            .decode(self.prune)
            .ok_or_else(|| Error::invalid("model has no topics"))?;
        Ok(Decoded {
            labels,
            topic: Some(z),
            probability,
        })
    }

    fn log_prob(&self, sample: &TriCrf2Sample, ws: &TopicWorkspace) -> f64 {
        let g = match sample.topic {
            Some(g) => g as usize,
            None => return LOG_ZERO,
        };
        if sample.seq.labels.len() != sample.seq.len() {
            return LOG_ZERO;
        }
        clamp_log(ws.log_prior[g] + ws.chains[g].path_score(&sample.seq.labels) - ws.log_norm)
    }

    fn gradient_contribution(
        &self,
        sample: &TriCrf2Sample,
        ws: &mut TopicWorkspace,
        grad: &mut [f64],
        factor: f64,
    ) -> Result<()> {
        let edges = self.seq.edge_index()?;
        let (gt, gseq) = grad.split_at_mut(self.topic.n_weight());
        accumulate_topic(&self.topic, &sample.topic_obs, &ws.posterior, gt, factor);
        let t_len = sample.seq.len();
        for (z, ctx) in ws.chains.iter_mut().enumerate() {
            let p = ws.posterior[z];
            if p == 0.0 {
                continue;
            }
            accumulate_states(ctx, &self.seq, &sample.seq.items, gseq, factor * p);
            ctx.accumulate_transitions(edges, gseq, factor * p);
            for y in 0..self.num_labels() as u32 {
                if let Some(slot) = self.psi_slot(z as u32, y) {
                    let expected: f64 = (0..t_len).map(|t| ctx.state_marginal(t, y as usize)).sum();
                    gt[slot as usize] += factor * p * expected;
                }
            }
        }
        Ok(())
    }

    fn marginal(&self, ws: &TopicWorkspace, t: usize, label: u32) -> f64 {
        ws.chains
            .iter()
            .zip(&ws.posterior)
            .map(|(ctx, p)| p * ctx.state_marginal(t, label as usize))
            .sum()
    }

    fn topic_marginal(&self, ws: &TopicWorkspace, topic: u32) -> f64 {
        ws.posterior.get(topic as usize).copied().unwrap_or(0.0)
    }

    fn pseudo_log_likelihood(
        &self,
        weights: &[f64],
        sample: &TriCrf2Sample,
        ws: &mut TopicWorkspace,
        grad: &mut [f64],
    ) -> Result<f64> {
        let gold = match sample.topic {
            Some(g) => g,
            None => return Ok(LOG_ZERO),
        };
        let nt = self.topic.n_weight();
        let (wt, wseq) = weights.split_at(nt);
        let (gt, gseq) = grad.split_at_mut(nt);
        let edges = self.seq.edge_index()?;
        let labels = &sample.seq.labels;

        // topic given the gold labels; the sequence features cancel
        topic_scores(&self.topic, wt, &sample.topic_obs, &mut ws.log_prior);
        let scores: Vec<f64> = (0..self.num_topics() as u32)
            .map(|z| {
                labels.iter().fold(ws.log_prior[z as usize], |acc, &y| {
                    acc + self
                        .psi_slot(z, y)
                        .map_or(f64::NEG_INFINITY, |s| wt[s as usize])
                })
            })
            .collect();
        let mut diff = Vec::with_capacity(scores.len());
        let mut total = clamp_log(topic_conditional(&scores, gold as usize, &mut diff));

        accumulate_topic(&self.topic, &sample.topic_obs, &diff, gt, 1.0);
        for (z, &d) in diff.iter().enumerate() {
            if d == 0.0 {
                continue;
            }
            for &y in labels {
                if let Some(slot) = self.psi_slot(z as u32, y) {
                    gt[slot as usize] += d;
                }
            }
        }

        // labels given their neighbours under the gold topic
        let bias = self.label_bias(wt, gold);
        total += chain_pseudo_likelihood(
            &self.seq,
            edges,
            wseq,
            gseq,
            &sample.seq,
            &bias,
            |y, d| {
                if let Some(slot) = self.psi_slot(gold, y) {
                    gt[slot as usize] += d;
                }
            },
        );
        Ok(total)
    }

    fn label_name(&self, id: u32) -> Option<&str> {
        self.seq.states().name(id)
    }

    fn topic_name(&self, id: u32) -> Option<&str> {
        self.topic.states().name(id)
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let (wt, wseq) = self.weights.split_at(self.topic.n_weight());
        self.topic.write_to(wt, writer)?;
        self.seq.write_to(wseq, writer)
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut reader = ModelReader::new(bytes);
        let (topic, mut weights) = reader.read_store()?;
        let (mut seq, w) = reader.read_store()?;
        reader.finish()?;
        seq.build_edge_index(true)?;
        weights.extend(w);
        let mut model = TriCrf2 {
            topic,
            seq,
            weights,
            ..TriCrf2::default()
        };
        model.rebuild_compatibility()?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::dataset::{Token, TopicEvent};

    fn doc(topic: &str, tokens: &[(&str, &str)]) -> Document {
        Document {
            topic: Some(TopicEvent::new(topic, vec![Attribute::from(tokens[0].1)])),
            tokens: tokens
                .iter()
                .map(|(label, w)| Token::new(*label, vec![Attribute::from(*w)]))
                .collect(),
        }
    }

    fn model() -> (TriCrf2, Vec<TriCrf2Sample>) {
        let docs = vec![
            doc("flight", &[("O", "to"), ("CITY", "boston")]),
            doc("fare", &[("O", "cost"), ("CLASS", "first"), ("O", "to")]),
        ];
        let (mut model, samples) = TriCrf2::build(&docs).unwrap();
        model.finalize(None).unwrap();
        for (i, w) in model.weights_mut().iter_mut().enumerate() {
            *w = ((i * 3 % 7) as f64 - 3.0) / 2.0;
        }
        (model, samples)
    }

    #[test]
    fn test_compatibility_matrix() {
        let (model, _) = model();
        let class = model.sequence_store().find_state("CLASS").unwrap();
        let city = model.sequence_store().find_state("CITY").unwrap();
        let o = model.sequence_store().find_state("O").unwrap();
        assert!(!model.is_allowed(0, class));
        assert!(model.is_allowed(0, city));
        assert!(model.is_allowed(1, class));
        assert!(!model.is_allowed(1, city));
        assert!(model.is_allowed(0, o) && model.is_allowed(1, o));
    }

    #[test]
    fn test_forbidden_labels_get_no_mass() {
        let (model, samples) = model();
        let w = model.weights().to_vec();
        let mut ws = model.workspace(3);
        let sample = &samples[1];
        model.calculate_factors(&w, sample, &mut ws).unwrap();
        model.forward(&mut ws).unwrap();
        model.backward(&mut ws).unwrap();

        let class = model.sequence_store().find_state("CLASS").unwrap();
        for t in 0..3 {
            assert_eq!(ws.chain(0).state_marginal(t, class as usize), 0.0);
            let mass: f64 = (0..model.num_labels() as u32)
                .map(|y| model.marginal(&ws, t, y))
                .sum();
            assert!((mass - 1.0).abs() < 1e-9);
        }

        let k = model.num_labels() as u32;
        let mut total = 0.0;
        for z in 0..2 {
            for a in 0..k {
                for b in 0..k {
                    for c in 0..k {
                        let score = ws.log_prior[z] + ws.chains[z].path_score(&[a, b, c]);
                        total += (score - ws.log_norm).exp();
                    }
                }
            }
        }
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_viterbi_respects_compatibility() {
        let (model, samples) = model();
        let w = model.weights().to_vec();
        let mut ws = model.workspace(3);
        model.calculate_factors(&w, &samples[1], &mut ws).unwrap();
        model.forward(&mut ws).unwrap();
        let decoded = model.viterbi_search(&mut ws).unwrap();
        let z = decoded.topic.unwrap();
        assert!(decoded.labels.iter().all(|&y| model.is_allowed(z, y)));
        assert!(decoded.probability > 0.0 && decoded.probability <= 1.0);
    }

    #[test]
    fn test_save_load_round_trip() {
        let (model, _) = model();
        let mut buf = Vec::new();
        model.write_to(&mut buf).unwrap();
        let loaded = TriCrf2::read_from(&buf).unwrap();
        assert_eq!(loaded.weights(), model.weights());
        assert_eq!(loaded.allowed, model.allowed);
        assert_eq!(loaded.psi, model.psi);
        assert_eq!(loaded.topic_name(0), Some("flight"));
    }
}
