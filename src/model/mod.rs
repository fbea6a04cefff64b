//! Inference engines and the capability interface they share.

mod crf;
mod maxent;
mod topic;
mod tricrf1;
mod tricrf2;

use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::attribute::Attribute;
use crate::context::ChainContext;
use crate::dataset::{Document, Item, Observation, Sequence, Token};
use crate::error::{clamp_log, Error, Result, LOG_ZERO};
use crate::param::{EdgeIndex, ParamStore};

pub use self::crf::Crf;
pub use self::maxent::{EventWorkspace, MaxEnt};
pub use self::topic::TopicWorkspace;
pub use self::tricrf1::{TriCrf1, TriCrf1Sample};
pub use self::tricrf2::{TriCrf2, TriCrf2Sample};

/// Model variant selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Maximum-entropy classifier of independent events
    MaxEnt,
    /// Linear-chain CRF
    Crf,
    /// Triangular-chain CRF with one sequence model per topic
    TriCrf1,
    /// Triangular-chain CRF with a shared sequence model and topic/label
    /// compatibility weights
    TriCrf2,
}

impl FromStr for ModelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "maxent" => Ok(ModelType::MaxEnt),
            "crf" => Ok(ModelType::Crf),
            "tricrf1" => Ok(ModelType::TriCrf1),
            "tricrf2" => Ok(ModelType::TriCrf2),
            _ => Err(Error::Config(format!("unknown model type '{}'", s))),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelType::MaxEnt => "MaxEnt",
            ModelType::Crf => "CRF",
            ModelType::TriCrf1 => "TriCRF1",
            ModelType::TriCrf2 => "TriCRF2",
        })
    }
}

/// Best labelling of a sample
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Label ids in the model's label dictionary
    pub labels: Vec<u32>,
    /// Topic id for triangular models
    pub topic: Option<u32>,
    /// Probability of the returned assignment
    pub probability: f64,
}

/// Capability interface of the sequence models.
///
/// A model owns its parameter stores and a weight arena laid out as the
/// concatenation of the stores' slot ranges. The inference operations take
/// the weights explicitly so training can evaluate candidate points without
/// copying them into the model.
///
/// The per-sample operations are meant to be called in order:
/// [`calculate_factors`](Self::calculate_factors), [`forward`](Self::forward),
/// then [`backward`](Self::backward) for expectations and marginals.
pub trait SequenceModel: Sized {
    /// A document encoded against the model's dictionaries
    type Sample;
    /// Scratch lattices reused across samples
    type Workspace;

    const MODEL_TYPE: ModelType;

    /// Intern the training documents into fresh stores, accumulating the
    /// empirical feature counts, and encode them.
    fn build(docs: &[Document]) -> Result<(Self, Vec<Self::Sample>)>;

    /// Finalise the stores, build their edge indices (tied when `tied`
    /// gives a minimum count) and allocate zero weights.
    fn finalize(&mut self, tied: Option<f64>) -> Result<()>;

    fn weights(&self) -> &[f64];

    fn weights_mut(&mut self) -> &mut Vec<f64>;

    /// Empirical feature counts laid out like the weight arena
    fn empirical_counts(&self, out: &mut [f64]);

    /// Copy tied remainder weights into the folded transition slots
    fn materialize_tied(&mut self) -> Result<()>;

    /// Keep only transitions whose potential differs from the default by
    /// more than `threshold`
    fn prune_transitions(&mut self, threshold: f64) -> Result<()>;

    /// Skip topics whose log prior is more than `threshold` below the best
    /// one while decoding. Chain models ignore it.
    fn set_topic_prune(&mut self, _threshold: f64) {}

    /// Encode a document without growing the dictionaries: unknown
    /// observations are dropped and unknown labels map to the default state.
    fn encode(&self, doc: &Document) -> Result<Self::Sample>;

    fn sample_len(sample: &Self::Sample) -> usize;

    fn workspace(&self, max_len: usize) -> Self::Workspace;

    /// Compute the node and transition potentials of a sample
    fn calculate_factors(
        &self,
        weights: &[f64],
        sample: &Self::Sample,
        ws: &mut Self::Workspace,
    ) -> Result<()>;

    /// Run the forward recursion and return `log Z`
    fn forward(&self, ws: &mut Self::Workspace) -> Result<f64>;

    fn backward(&self, ws: &mut Self::Workspace) -> Result<()>;

    /// `log Z` of the last forward pass
    fn log_partition(&self, ws: &Self::Workspace) -> f64;

    fn partition_z(&self, ws: &Self::Workspace) -> f64 {
        self.log_partition(ws).exp()
    }

    /// Most probable assignment; needs a forward pass for the probability
    fn viterbi_search(&self, ws: &mut Self::Workspace) -> Result<Decoded>;

    /// `log P(gold | x)`, [`LOG_ZERO`] for impossible assignments
    fn log_prob(&self, sample: &Self::Sample, ws: &Self::Workspace) -> f64;

    fn calculate_prob(&self, sample: &Self::Sample, ws: &Self::Workspace) -> f64 {
        self.log_prob(sample, ws).exp()
    }

    /// Add `factor` times the model expectations of the features to `grad`
    fn gradient_contribution(
        &self,
        sample: &Self::Sample,
        ws: &mut Self::Workspace,
        grad: &mut [f64],
        factor: f64,
    ) -> Result<()>;

    /// Marginal probability of `label` at position `t`
    fn marginal(&self, ws: &Self::Workspace, t: usize, label: u32) -> f64;

    /// Posterior probability of a topic; chain models have none
    fn topic_marginal(&self, _ws: &Self::Workspace, _topic: u32) -> f64 {
        0.0
    }

    /// Log pseudo-likelihood of the gold assignment; adds the gradient of
    /// its negation to `grad`.
    fn pseudo_log_likelihood(
        &self,
        weights: &[f64],
        sample: &Self::Sample,
        ws: &mut Self::Workspace,
        grad: &mut [f64],
    ) -> Result<f64>;

    fn label_name(&self, id: u32) -> Option<&str>;

    fn topic_name(&self, _id: u32) -> Option<&str> {
        None
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()>;

    fn read_from(bytes: &[u8]) -> Result<Self>;

    /// Save the model to a file
    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Load a model from a file
    fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::read_from(&bytes)
    }
}

fn check_attribute(attr: &Attribute) -> Result<()> {
    if attr.is_reserved() {
        return Err(Error::invalid(format!(
            "observation '{}' uses the reserved '@' prefix",
            attr.name
        )));
    }
    Ok(())
}

/// Intern the observations of a training event and register their
/// parameters for `label`
pub(crate) fn intern_item(
    store: &mut ParamStore,
    attrs: &[Attribute],
    label: u32,
) -> Result<Item> {
    let mut item = Item::with_capacity(attrs.len());
    for attr in attrs {
        check_attribute(attr)?;
        let id = store.add_new_observation(&attr.name)?;
        store.update_param(label, id, attr.value)?;
        item.push(Observation::new(id, attr.value));
    }
    Ok(item)
}

/// Intern a labelled token sequence into a chain store, registering node
/// and previous-label parameters
pub(crate) fn intern_chain(store: &mut ParamStore, tokens: &[Token]) -> Result<Sequence> {
    let mut seq = Sequence::with_capacity(tokens.len());
    for (t, token) in tokens.iter().enumerate() {
        let label = store.add_new_state(&token.label)?;
        let item = intern_item(store, &token.attrs, label)?;
        if t > 0 {
            let edge = store.add_edge_feature(seq.labels[t - 1])?;
            store.update_param(label, edge, 1.0)?;
        }
        seq.push(item, label);
    }
    Ok(seq)
}

/// Look up observations without interning; unknown and reserved names are
/// dropped
pub(crate) fn lookup_item(store: &ParamStore, attrs: &[Attribute]) -> Item {
    attrs
        .iter()
        .filter(|attr| !attr.is_reserved())
        .filter_map(|attr| {
            store
                .find_observation(&attr.name)
                .map(|id| Observation::new(id, attr.value))
        })
        .collect()
}

pub(crate) fn lookup_chain(store: &ParamStore, tokens: &[Token]) -> Sequence {
    let default = store.default_state();
    let mut seq = Sequence::with_capacity(tokens.len());
    for token in tokens {
        let label = store.find_state(&token.label).unwrap_or(default);
        seq.push(lookup_item(store, &token.attrs), label);
    }
    seq
}

/// Add the node scores of every item to the lattice
pub(crate) fn fill_state_scores(
    ctx: &mut ChainContext,
    store: &ParamStore,
    weights: &[f64],
    items: &[Item],
) {
    for (t, item) in items.iter().enumerate() {
        for obs in item {
            for param in store.params(obs.id) {
                ctx.state[[t, param.label as usize]] += weights[param.slot as usize] * obs.value;
            }
        }
    }
}

/// Add `factor` times the expected node feature counts to `grad`
pub(crate) fn accumulate_states(
    ctx: &ChainContext,
    store: &ParamStore,
    items: &[Item],
    grad: &mut [f64],
    factor: f64,
) {
    for (t, item) in items.iter().enumerate() {
        for obs in item {
            for param in store.params(obs.id) {
                let prob = ctx.state_marginal(t, param.label as usize);
                grad[param.slot as usize] += factor * prob * obs.value;
            }
        }
    }
}

/// Add `factor` times the feature counts of one label path to `grad`
pub(crate) fn accumulate_path(
    store: &ParamStore,
    edges: &EdgeIndex,
    items: &[Item],
    labels: &[u32],
    grad: &mut [f64],
    factor: f64,
) {
    for (t, (item, &y)) in items.iter().zip(labels).enumerate() {
        for obs in item {
            if let Some(slot) = store.slot(obs.id, y) {
                grad[slot as usize] += factor * obs.value;
            }
        }
        if t > 0 {
            if let Some(slot) = edges.slot(labels[t - 1], y) {
                grad[slot as usize] += factor;
            }
        }
    }
}

/// Sum of the log conditionals `log P(y_t | y_{t-1}, y_{t+1}, x)` of the
/// gold labels of `seq`.
///
/// `bias[y]` is added to every node score of label `y` (`-inf` forbids the
/// label; an empty slice means no bias). The gradient of the negated sum is
/// added to `grad`; `bias_grad(y, d)` receives the derivative with respect to
/// the bias of `y`.
pub(crate) fn chain_pseudo_likelihood<B>(
    store: &ParamStore,
    edges: &EdgeIndex,
    weights: &[f64],
    grad: &mut [f64],
    seq: &Sequence,
    bias: &[f64],
    mut bias_grad: B,
) -> f64
where
    B: FnMut(u32, f64),
{
    let k = store.num_states();
    let t_len = seq.len();
    let labels = &seq.labels;
    let mut scores = vec![0.0; k];
    let mut probs = vec![0.0; k];
    let mut total = 0.0;

    for t in 0..t_len {
        match bias {
            [] => scores.iter_mut().for_each(|s| *s = 0.0),
            _ => scores.copy_from_slice(bias),
        }
        for obs in &seq.items[t] {
            for param in store.params(obs.id) {
                scores[param.label as usize] += weights[param.slot as usize] * obs.value;
            }
        }
        for (y, score) in scores.iter_mut().enumerate() {
            if t > 0 {
                *score += edges.transition_weight(weights, labels[t - 1], y as u32);
            }
            if t + 1 < t_len {
                *score += edges.transition_weight(weights, y as u32, labels[t + 1]);
            }
        }

        let lse = log_sum_exp(&scores);
        if !lse.is_finite() {
            total += LOG_ZERO;
            continue;
        }
        let gold = labels[t] as usize;
        total += clamp_log(scores[gold] - lse);
        for (p, &s) in probs.iter_mut().zip(&scores) {
            *p = (s - lse).exp();
        }

        let diff = |y: usize| probs[y] - if y == gold { 1.0 } else { 0.0 };
        for obs in &seq.items[t] {
            for param in store.params(obs.id) {
                grad[param.slot as usize] += diff(param.label as usize) * obs.value;
            }
        }
        for y in 0..k {
            let d = diff(y);
            if d == 0.0 {
                continue;
            }
            if t > 0 {
                if let Some(slot) = edges.slot(labels[t - 1], y as u32) {
                    grad[slot as usize] += d;
                }
            }
            if t + 1 < t_len {
                if let Some(slot) = edges.slot(y as u32, labels[t + 1]) {
                    grad[slot as usize] += d;
                }
            }
            if !bias.is_empty() {
                bias_grad(y as u32, d);
            }
        }
    }
    total
}

/// `log(sum(exp(values)))`, `-inf` for an empty slice or when every value
/// is `-inf`
pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}
