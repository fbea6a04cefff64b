use std::io::Write;

use tracing::debug;

use super::{
    accumulate_states, chain_pseudo_likelihood, fill_state_scores, intern_chain, lookup_chain,
    Decoded, ModelType, SequenceModel,
};
use crate::context::{ChainContext, Flag};
use crate::dataset::{Document, Sequence};
use crate::error::{clamp_log, Result, LOG_ZERO};
use crate::param::{ModelReader, ParamStore};

/// Linear-chain CRF over one parameter store
#[derive(Debug, Clone, Default)]
pub struct Crf {
    store: ParamStore,
    weights: Vec<f64>,
}

impl Crf {
    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    pub fn num_labels(&self) -> usize {
        self.store.num_states()
    }
}

impl SequenceModel for Crf {
    type Sample = Sequence;
    type Workspace = ChainContext;

    const MODEL_TYPE: ModelType = ModelType::Crf;

    fn build(docs: &[Document]) -> Result<(Self, Vec<Sequence>)> {
        let mut model = Crf::default();
        let samples = docs
            .iter()
            .map(|doc| intern_chain(&mut model.store, &doc.tokens))
            .collect::<Result<Vec<_>>>()?;
        Ok((model, samples))
    }

    fn finalize(&mut self, tied: Option<f64>) -> Result<()> {
        self.store.finalize()?;
        match tied {
            Some(min_count) => {
                self.store.build_tied_index(min_count)?;
            }
            None => self.store.build_edge_index(true)?,
        }
        self.weights = vec![0.0; self.store.n_weight()];
        let stats = self.store.stats();
        debug!(
            states = stats.num_states,
            features = stats.num_features,
            params = stats.num_params,
            "finalized CRF"
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
        self.store.materialize_tied(&mut self.weights)
    }

    fn prune_transitions(&mut self, threshold: f64) -> Result<()> {
        self.store.build_active_index(&self.weights, threshold)
    }

    fn encode(&self, doc: &Document) -> Result<Sequence> {
        Ok(lookup_chain(&self.store, &doc.tokens))
    }

    fn sample_len(sample: &Sequence) -> usize {
        sample.len()
    }

    fn workspace(&self, max_len: usize) -> ChainContext {
        ChainContext::new(Flag::ALL, self.store.num_states(), max_len)
    }

    fn calculate_factors(
        &self,
        weights: &[f64],
        sample: &Sequence,
        ctx: &mut ChainContext,
    ) -> Result<()> {
        let edges = self.store.edge_index()?;
        ctx.set_num_items(sample.len());
        fill_state_scores(ctx, &self.store, weights, &sample.items);
        ctx.set_transitions(edges, weights);
        ctx.exp_factors();
        Ok(())
    }

    fn forward(&self, ctx: &mut ChainContext) -> Result<f64> {
        Ok(ctx.forward(self.store.edge_index()?))
    }

    fn backward(&self, ctx: &mut ChainContext) -> Result<()> {
        ctx.backward(self.store.edge_index()?);
        Ok(())
    }

    fn log_partition(&self, ctx: &ChainContext) -> f64 {
        ctx.log_norm()
    }

    fn viterbi_search(&self, ctx: &mut ChainContext) -> Result<Decoded> {
        let (labels, score) = ctx.viterbi();
        Ok(Decoded {
            labels,
            topic: None,
            probability: (score - ctx.log_norm()).exp(),
        })
    }

    fn log_prob(&self, sample: &Sequence, ctx: &ChainContext) -> f64 {
        if sample.labels.len() != sample.len() {
            return LOG_ZERO;
        }
        clamp_log(ctx.path_score(&sample.labels) - ctx.log_norm())
    }

    fn gradient_contribution(
        &self,
        sample: &Sequence,
        ctx: &mut ChainContext,
        grad: &mut [f64],
        factor: f64,
    ) -> Result<()> {
        let edges = self.store.edge_index()?;
        accumulate_states(ctx, &self.store, &sample.items, grad, factor);
        ctx.accumulate_transitions(edges, grad, factor);
        Ok(())
    }

    fn marginal(&self, ctx: &ChainContext, t: usize, label: u32) -> f64 {
        ctx.state_marginal(t, label as usize)
    }

    fn pseudo_log_likelihood(
        &self,
        weights: &[f64],
        sample: &Sequence,
        _ctx: &mut ChainContext,
        grad: &mut [f64],
    ) -> Result<f64> {
        let edges = self.store.edge_index()?;
        Ok(chain_pseudo_likelihood(
            &self.store,
            edges,
            weights,
            grad,
            sample,
            &[],
            |_, _| {},
        ))
    }

    fn label_name(&self, id: u32) -> Option<&str> {
        self.store.states().name(id)
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.store.write_to(&self.weights, writer)
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut reader = ModelReader::new(bytes);
        let (mut store, weights) = reader.read_store()?;
        reader.finish()?;
        store.build_edge_index(true)?;
        Ok(Crf { store, weights })
    }
}
