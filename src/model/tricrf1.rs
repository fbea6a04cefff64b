use std::io::Write;
use std::ops::Range;

use tracing::debug;

use super::topic::{accumulate_topic, topic_conditional, topic_scores, TopicWorkspace};
use super::{
    accumulate_path, accumulate_states, chain_pseudo_likelihood, fill_state_scores, intern_chain,
    intern_item, lookup_item, Decoded, ModelType, SequenceModel,
};
use crate::context::{ChainContext, Flag};
use crate::dataset::{Document, Item, Sequence};
use crate::dictionary::Dictionary;
use crate::error::{clamp_log, Error, Result, LOG_ZERO};
use crate::param::{ModelReader, ParamStore, OUTSIDE_STATE};

/// A document encoded for [`TriCrf1`]
#[derive(Debug, Clone, Default)]
pub struct TriCrf1Sample {
    pub(crate) topic_obs: Item,
    pub(crate) topic: Option<u32>,
    /// The tokens encoded against every topic's store. The labels of a view
    /// are empty when a gold label does not exist under that topic.
    pub(crate) views: Vec<Sequence>,
    /// Gold labels in the global label dictionary
    pub(crate) labels: Vec<u32>,
}

/// Triangular-chain CRF with an independent sequence model per topic.
///
/// The weight arena holds the topic store first, then the sequence stores
/// in topic order. Label ids reported to callers are global; every topic
/// keeps its own local numbering.
#[derive(Debug, Clone)]
pub struct TriCrf1 {
    topic: ParamStore,
    seqs: Vec<ParamStore>,
    labels: Dictionary,
    to_global: Vec<Vec<u32>>,
    to_local: Vec<Vec<Option<u32>>>,
    offsets: Vec<usize>,
    weights: Vec<f64>,
    prune: f64,
}

impl Default for TriCrf1 {
    fn default() -> Self {
        Self {
            topic: ParamStore::new(),
            seqs: Vec::new(),
            labels: Dictionary::new(),
            to_global: Vec::new(),
            to_local: Vec::new(),
            offsets: Vec::new(),
            weights: Vec::new(),
            prune: f64::INFINITY,
        }
    }
}

impl TriCrf1 {
    pub fn num_topics(&self) -> usize {
        self.topic.num_states()
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn topic_store(&self) -> &ParamStore {
        &self.topic
    }

    /// Sequence store of topic `z`
    pub fn sequence_store(&self, z: usize) -> &ParamStore {
        &self.seqs[z]
    }

    /// Weight range of the sequence store of topic `z`
    pub fn sequence_range(&self, z: usize) -> Range<usize> {
        let start = self.offsets[z];
        start..start + self.seqs[z].n_weight()
    }

    fn default_label(&self) -> u32 {
        self.labels.get(OUTSIDE_STATE).unwrap_or(0)
    }

    /// Number the labels globally by walking the topics in order, then
    /// each topic's local labels in order
    fn index_labels(&mut self) -> Result<()> {
        let mut labels = Dictionary::new();
        self.to_global = self
            .seqs
            .iter()
            .map(|store| {
                store
                    .states()
                    .iter()
                    .map(|(name, _)| labels.get_or_insert(name))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        self.labels = labels;
        self.rebuild_label_maps();
        Ok(())
    }

    fn rebuild_label_maps(&mut self) {
        let n = self.labels.len();
        self.to_local = self
            .to_global
            .iter()
            .map(|map| {
                let mut local = vec![None; n];
                for (l, &g) in map.iter().enumerate() {
                    local[g as usize] = Some(l as u32);
                }
                local
            })
            .collect();
    }

    fn compute_offsets(&mut self) -> usize {
        let mut offset = self.topic.n_weight();
        self.offsets.clear();
        for store in &self.seqs {
            self.offsets.push(offset);
            offset += store.n_weight();
        }
        offset
    }
}

impl SequenceModel for TriCrf1 {
    type Sample = TriCrf1Sample;
    type Workspace = TopicWorkspace;

    const MODEL_TYPE: ModelType = ModelType::TriCrf1;

    fn build(docs: &[Document]) -> Result<(Self, Vec<TriCrf1Sample>)> {
        let mut model = TriCrf1::default();
        for doc in docs {
            let event = doc.topic.as_ref().ok_or_else(|| {
                Error::invalid("triangular models need a topic for every training sequence")
            })?;
            let z = model.topic.add_new_state(&event.label)?;
            intern_item(&mut model.topic, &event.attrs, z)?;
            let z = z as usize;
            if z == model.seqs.len() {
                model.seqs.push(ParamStore::new());
            }
            intern_chain(&mut model.seqs[z], &doc.tokens)?;
        }
        model.index_labels()?;
        let samples = docs
            .iter()
            .map(|doc| model.encode(doc))
            .collect::<Result<Vec<_>>>()?;
        Ok((model, samples))
    }

    fn finalize(&mut self, tied: Option<f64>) -> Result<()> {
        self.topic.finalize()?;
        for store in &mut self.seqs {
            store.finalize()?;
            match tied {
                Some(min_count) => {
                    store.build_tied_index(min_count)?;
                }
                None => store.build_edge_index(true)?,
            }
        }
        self.labels.seal();
        let n = self.compute_offsets();
        self.weights = vec![0.0; n];
        debug!(
            topics = self.num_topics(),
            labels = self.num_labels(),
            weights = n,
            "finalized TriCRF1"
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
        let nt = self.topic.n_weight();
        self.topic.fill_empirical(&mut out[..nt]);
        for (z, store) in self.seqs.iter().enumerate() {
            store.fill_empirical(&mut out[self.sequence_range(z)]);
        }
    }

    fn materialize_tied(&mut self) -> Result<()> {
        for z in 0..self.seqs.len() {
            let range = self.sequence_range(z);
            self.seqs[z].materialize_tied(&mut self.weights[range])?;
        }
        Ok(())
    }

    fn prune_transitions(&mut self, threshold: f64) -> Result<()> {
        for z in 0..self.seqs.len() {
            let range = self.sequence_range(z);
            self.seqs[z].build_active_index(&self.weights[range], threshold)?;
        }
        Ok(())
    }

    fn set_topic_prune(&mut self, threshold: f64) {
        self.prune = threshold;
    }

    fn encode(&self, doc: &Document) -> Result<TriCrf1Sample> {
        let (topic_obs, topic) = match &doc.topic {
            Some(event) => (
                lookup_item(&self.topic, &event.attrs),
                self.topic.find_state(&event.label),
            ),
            None => (Item::new(), None),
        };
        let default = self.default_label();
        let labels: Vec<u32> = doc
            .tokens
            .iter()
            .map(|t| self.labels.get(&t.label).unwrap_or(default))
            .collect();
        let views = self
            .seqs
            .iter()
            .zip(&self.to_local)
            .map(|(store, local)| Sequence {
                items: doc
                    .tokens
                    .iter()
                    .map(|t| lookup_item(store, &t.attrs))
                    .collect(),
                labels: labels
                    .iter()
                    .map(|&g| local.get(g as usize).copied().flatten())
                    .collect::<Option<Vec<u32>>>()
                    .unwrap_or_default(),
            })
            .collect();
        Ok(TriCrf1Sample {
            topic_obs,
            topic,
            views,
            labels,
        })
    }

    fn sample_len(sample: &TriCrf1Sample) -> usize {
        sample.labels.len()
    }

    fn workspace(&self, max_len: usize) -> TopicWorkspace {
        TopicWorkspace::new(
            self.seqs
                .iter()
                .map(|s| ChainContext::new(Flag::ALL, s.num_states(), max_len))
                .collect(),
        )
    }

    fn calculate_factors(
        &self,
        weights: &[f64],
        sample: &TriCrf1Sample,
        ws: &mut TopicWorkspace,
    ) -> Result<()> {
        let nt = self.topic.n_weight();
        topic_scores(&self.topic, &weights[..nt], &sample.topic_obs, &mut ws.log_prior);
        for (z, store) in self.seqs.iter().enumerate() {
            let w = &weights[self.sequence_range(z)];
            let edges = store.edge_index()?;
            let view = &sample.views[z];
            let ctx = &mut ws.chains[z];
            ctx.set_num_items(view.len());
            fill_state_scores(ctx, store, w, &view.items);
            ctx.set_transitions(edges, w);
            ctx.exp_factors();
        }
        Ok(())
    }

    fn forward(&self, ws: &mut TopicWorkspace) -> Result<f64> {
        for (z, store) in self.seqs.iter().enumerate() {
            ws.log_z[z] = ws.chains[z].forward(store.edge_index()?);
        }
        Ok(ws.combine())
    }

    fn backward(&self, ws: &mut TopicWorkspace) -> Result<()> {
        for (z, store) in self.seqs.iter().enumerate() {
            ws.chains[z].backward(store.edge_index()?);
        }
        Ok(())
    }

    fn log_partition(&self, ws: &TopicWorkspace) -> f64 {
        ws.log_norm
    }

    fn viterbi_search(&self, ws: &mut TopicWorkspace) -> Result<Decoded> {
        let (z, local, probability) = ws
            .decode(self.prune)
            .ok_or_else(|| Error::invalid("model has no topics"))?;
        let map = &self.to_global[z as usize];
        Ok(Decoded {
            labels: local.iter().map(|&l| map[l as usize]).collect(),
            topic: Some(z),
            probability,
        })
    }

    fn log_prob(&self, sample: &TriCrf1Sample, ws: &TopicWorkspace) -> f64 {
        let g = match sample.topic {
            Some(g) => g as usize,
            None => return LOG_ZERO,
        };
        let view = &sample.views[g];
        if view.labels.len() != view.len() {
            return LOG_ZERO;
        }
        clamp_log(ws.log_prior[g] + ws.chains[g].path_score(&view.labels) - ws.log_norm)
    }

    fn gradient_contribution(
        &self,
        sample: &TriCrf1Sample,
        ws: &mut TopicWorkspace,
        grad: &mut [f64],
        factor: f64,
    ) -> Result<()> {
        let nt = self.topic.n_weight();
        accumulate_topic(
            &self.topic,
            &sample.topic_obs,
            &ws.posterior,
            &mut grad[..nt],
            factor,
        );
        for (z, store) in self.seqs.iter().enumerate() {
            let p = ws.posterior[z];
            if p == 0.0 {
                continue;
            }
            let edges = store.edge_index()?;
            let g = &mut grad[self.sequence_range(z)];
            let ctx = &mut ws.chains[z];
            accumulate_states(ctx, store, &sample.views[z].items, g, factor * p);
            ctx.accumulate_transitions(edges, g, factor * p);
        }
        Ok(())
    }

    fn marginal(&self, ws: &TopicWorkspace, t: usize, label: u32) -> f64 {
        self.to_local
            .iter()
            .enumerate()
            .filter_map(|(z, local)| {
                let l = local.get(label as usize).copied().flatten()?;
                Some(ws.posterior[z] * ws.chains[z].state_marginal(t, l as usize))
            })
            .sum()
    }

    fn topic_marginal(&self, ws: &TopicWorkspace, topic: u32) -> f64 {
        ws.posterior.get(topic as usize).copied().unwrap_or(0.0)
    }

    fn pseudo_log_likelihood(
        &self,
        weights: &[f64],
        sample: &TriCrf1Sample,
        ws: &mut TopicWorkspace,
        grad: &mut [f64],
    ) -> Result<f64> {
        let gold = match sample.topic {
            Some(g) => g as usize,
            None => return Ok(LOG_ZERO),
        };
        self.calculate_factors(weights, sample, ws)?;

        // topic given the gold labels
        let scores: Vec<f64> = sample
            .views
            .iter()
            .enumerate()
            .map(|(z, view)| {
                if view.labels.len() == view.len() {
                    ws.log_prior[z] + ws.chains[z].path_score(&view.labels)
                } else {
                    f64::NEG_INFINITY
                }
            })
            .collect();
        let mut diff = Vec::with_capacity(scores.len());
        let mut total = clamp_log(topic_conditional(&scores, gold, &mut diff));

        let nt = self.topic.n_weight();
        accumulate_topic(&self.topic, &sample.topic_obs, &diff, &mut grad[..nt], 1.0);
        for (z, store) in self.seqs.iter().enumerate() {
            if diff[z] == 0.0 {
                continue;
            }
            let view = &sample.views[z];
            let g = &mut grad[self.sequence_range(z)];
            accumulate_path(store, store.edge_index()?, &view.items, &view.labels, g, diff[z]);
        }

        // labels given their neighbours under the gold topic
        let store = &self.seqs[gold];
        let range = self.sequence_range(gold);
        total += chain_pseudo_likelihood(
            store,
            store.edge_index()?,
            &weights[range.clone()],
            &mut grad[range],
            &sample.views[gold],
            &[],
            |_, _| {},
        );
        Ok(total)
    }

    fn label_name(&self, id: u32) -> Option<&str> {
        self.labels.name(id)
    }

    fn topic_name(&self, id: u32) -> Option<&str> {
        self.topic.states().name(id)
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let nt = self.topic.n_weight();
        self.topic.write_to(&self.weights[..nt], writer)?;
        for (z, store) in self.seqs.iter().enumerate() {
            store.write_to(&self.weights[self.sequence_range(z)], writer)?;
        }
        Ok(())
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut reader = ModelReader::new(bytes);
        let (topic, mut weights) = reader.read_store()?;
        let mut model = TriCrf1 {
            topic,
            ..TriCrf1::default()
        };
        for z in 0..model.num_topics() {
            let (mut store, w) = reader.read_store().map_err(|e| match e {
                Error::Model(msg) => Error::model(format!("topic {}: {}", z, msg)),
                other => other,
            })?;
            store.build_edge_index(true)?;
            model.seqs.push(store);
            weights.extend(w);
        }
        reader.finish()?;
        model.index_labels()?;
        model.labels.seal();
        model.compute_offsets();
        model.weights = weights;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::dataset::{Token, TopicEvent};

    fn doc(topic: &str, topic_attrs: &[&str], tokens: &[(&str, &str)]) -> Document {
        Document {
            topic: Some(TopicEvent::new(
                topic,
                topic_attrs.iter().map(|a| Attribute::from(*a)).collect(),
            )),
            tokens: tokens
                .iter()
                .map(|(label, w)| Token::new(*label, vec![Attribute::from(*w)]))
                .collect(),
        }
    }

    fn docs() -> Vec<Document> {
        vec![
            doc("flight", &["to", "from"], &[("O", "to"), ("CITY", "boston")]),
            doc("fare", &["cost"], &[("O", "cost"), ("CLASS", "first"), ("O", "to")]),
            doc("flight", &["to"], &[("CITY", "denver"), ("O", "from")]),
        ]
    }

    fn model() -> (TriCrf1, Vec<TriCrf1Sample>) {
        let (mut model, samples) = TriCrf1::build(&docs()).unwrap();
        model.finalize(None).unwrap();
        for (i, w) in model.weights_mut().iter_mut().enumerate() {
            *w = ((i * 5 % 9) as f64 - 4.0) / 3.0;
        }
        (model, samples)
    }

    #[test]
    fn test_label_maps() {
        let (model, samples) = model();
        assert_eq!(model.num_topics(), 2);
        assert_eq!(model.num_labels(), 3);
        // CLASS never occurs under "flight"
        let class = model.labels.get("CLASS").unwrap();
        assert_eq!(model.to_local[0][class as usize], None);
        assert!(samples[1].views[0].labels.is_empty());
        assert_eq!(samples[1].views[1].labels.len(), 3);
        assert_eq!(samples[0].topic, Some(0));
    }

    #[test]
    fn test_probabilities_are_normalized() {
        let (model, samples) = model();
        let w = model.weights().to_vec();
        let mut ws = model.workspace(3);
        let sample = &samples[1];
        model.calculate_factors(&w, sample, &mut ws).unwrap();
        model.forward(&mut ws).unwrap();
        model.backward(&mut ws).unwrap();

        // sum over topics and every local path
        let mut total = 0.0;
        for z in 0..model.num_topics() {
            let k = model.sequence_store(z).num_states() as u32;
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

        let posterior: f64 = ws.posterior().iter().sum();
        assert!((posterior - 1.0).abs() < 1e-12);
        for t in 0..3 {
            let mass: f64 = (0..model.num_labels() as u32)
                .map(|y| model.marginal(&ws, t, y))
                .sum();
            assert!((mass - 1.0).abs() < 1e-9);
        }
        assert!(model.calculate_prob(sample, &ws) > 0.0);
    }

    #[test]
    fn test_viterbi_picks_best_topic_path() {
        let (model, samples) = model();
        let w = model.weights().to_vec();
        let mut ws = model.workspace(3);
        model.calculate_factors(&w, &samples[1], &mut ws).unwrap();
        model.forward(&mut ws).unwrap();
        let decoded = model.viterbi_search(&mut ws).unwrap();

        let mut best = f64::NEG_INFINITY;
        for z in 0..model.num_topics() {
            let k = model.sequence_store(z).num_states() as u32;
            for a in 0..k {
                for b in 0..k {
                    for c in 0..k {
                        best = best.max(ws.log_prior[z] + ws.chains[z].path_score(&[a, b, c]));
                    }
                }
            }
        }
        assert!((decoded.probability - (best - ws.log_norm).exp()).abs() < 1e-12);
        assert_eq!(decoded.labels.len(), 3);
    }

    #[test]
    fn test_save_load_round_trip() {
        let (model, _) = model();
        let mut buf = Vec::new();
        model.write_to(&mut buf).unwrap();
        let loaded = TriCrf1::read_from(&buf).unwrap();
        assert_eq!(loaded.weights(), model.weights());
        assert_eq!(loaded.num_labels(), model.num_labels());
        assert_eq!(loaded.to_global, model.to_global);
        assert_eq!(loaded.topic_name(1), Some("fare"));
        for y in 0..model.num_labels() as u32 {
            assert_eq!(loaded.label_name(y), model.label_name(y));
        }
    }

    #[test]
    fn test_missing_topic_is_rejected() {
        let mut docs = docs();
        docs[2].topic = None;
        assert!(matches!(
            TriCrf1::build(&docs),
            Err(Error::InvalidInput(_))
        ));
    }
}
