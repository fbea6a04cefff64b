use std::fmt;
use std::mem;

use tracing::{debug, info, warn};

use super::params::{Estimation, TrainParams};
use crate::attribute::Attribute;
use crate::dataset::Document;
use crate::error::{Error, Result};
use crate::model::{Crf, MaxEnt, SequenceModel, TriCrf1, TriCrf2};
use crate::optimize::{Lbfgs, Progress, Status};

/// Outcome of one optimisation run
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub status: Status,
    /// Final objective, regularisation included
    pub objective: f64,
    pub iterations: usize,
    pub evaluations: usize,
    /// Objective after each iteration
    pub history: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Objective {
    Likelihood,
    PseudoLikelihood,
}

impl Objective {
    fn name(self) -> &'static str {
        match self {
            Objective::Likelihood => "likelihood",
            Objective::PseudoLikelihood => "pseudo-likelihood",
        }
    }
}

/// Model built from the collected documents, with its encoded samples
struct Prepared<M: SequenceModel> {
    model: M,
    samples: Vec<M::Sample>,
    max_len: usize,
}

/// Trainer for a sequence model
///
/// Documents are collected with [`append`](Self::append) or
/// [`append_document`](Self::append_document). The model is built on the
/// first training call; appending more documents afterwards discards it.
pub struct Trainer<M: SequenceModel> {
    docs: Vec<Document>,
    /// Enable verbose output
    verbose: bool,
    /// Training parameters
    params: TrainParams,
    state: Option<Prepared<M>>,
}

impl<M: SequenceModel> Trainer<M> {
    /// Create a new trainer
    pub fn new() -> Self {
        Self {
            docs: Vec::new(),
            verbose: false,
            params: TrainParams::default(),
            state: None,
        }
    }

    /// Log per-iteration progress at `info` instead of `debug`
    pub fn verbose(&mut self, enabled: bool) -> &mut Self {
        self.verbose = enabled;
        self
    }

    /// Get training parameters
    pub fn params(&self) -> &TrainParams {
        &self.params
    }

    /// Get training parameters for mutation
    pub fn params_mut(&mut self) -> &mut TrainParams {
        &mut self.params
    }

    /// Set a training parameter by name
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        self.params.set(name, value)
    }

    /// Get a training parameter by name
    pub fn get(&self, name: &str) -> Result<String> {
        self.params.get(name)
    }

    /// Append a sequence without a topic
    pub fn append<I, L>(&mut self, xseq: &[I], yseq: &[L]) -> Result<()>
    where
        I: AsRef<[Attribute]>,
        L: AsRef<str>,
    {
        if xseq.len() != yseq.len() {
            return Err(Error::invalid("xseq and yseq must have the same length"));
        }
        self.append_document(Document::from_sequence(xseq, yseq))
    }

    /// Append a document
    pub fn append_document(&mut self, doc: Document) -> Result<()> {
        if doc.is_empty() {
            return Err(Error::invalid("empty sequences are not allowed"));
        }
        if let Some(attr) = doc
            .tokens
            .iter()
            .flat_map(|t| t.attrs.iter())
            .chain(doc.topic.iter().flat_map(|e| e.attrs.iter()))
            .find(|a| a.is_reserved())
        {
            return Err(Error::invalid(format!(
                "observation '{}' uses the reserved '@' prefix",
                attr.name
            )));
        }
        self.docs.push(doc);
        self.state = None;
        Ok(())
    }

    /// Clear all training data
    pub fn clear(&mut self) {
        self.docs.clear();
        self.state = None;
    }

    pub fn num_documents(&self) -> usize {
        self.docs.len()
    }

    /// The model under training, once built
    pub fn model(&self) -> Option<&M> {
        self.state.as_ref().map(|s| &s.model)
    }

    /// Build and finalise the model if that has not happened yet
    pub fn prepare(&mut self) -> Result<&M> {
        if self.state.is_none() {
            if self.docs.is_empty() {
                return Err(Error::invalid("no training data"));
            }
            let (mut model, samples) = M::build(&self.docs)?;
            model.finalize(self.params.tied_min_count())?;
            let max_len = samples.iter().map(M::sample_len).max().unwrap_or(0);
            let model_type = M::MODEL_TYPE;
            info!(
                model = %model_type,
                sequences = samples.len(),
                weights = model.weights().len(),
                max_len,
                "prepared training data"
            );
            self.state = Some(Prepared {
                model,
                samples,
                max_len,
            });
        }
        self.state
            .as_ref()
            .map(|s| &s.model)
            .ok_or_else(|| Error::invalid("no training data"))
    }

    /// Pseudo-likelihood training, used to initialise the weights
    pub fn pretrain(&mut self) -> Result<TrainReport> {
        let iterations = self.params.pretrain_iterations();
        self.run(Objective::PseudoLikelihood, iterations)
    }

    /// Maximum-likelihood training
    pub fn train(&mut self) -> Result<TrainReport> {
        let iterations = self.params.max_iterations();
        self.run(Objective::Likelihood, iterations)
    }

    /// Turn the trained weights into the final model: copy tied weights
    /// into their transitions and build the active index if requested.
    pub fn finish(self) -> Result<M> {
        let Prepared { mut model, .. } = self
            .state
            .ok_or_else(|| Error::invalid("no model has been trained"))?;
        if self.params.tied_min_count().is_some() {
            model.materialize_tied()?;
        }
        if let Some(threshold) = self.params.active_threshold() {
            model.prune_transitions(threshold)?;
        }
        Ok(model)
    }

    /// Optional pseudo-likelihood initialisation, maximum-likelihood
    /// training, then [`finish`](Self::finish).
    pub fn fit(mut self) -> Result<(M, TrainReport)> {
        if self.params.pseudo_likelihood_init() {
            let report = self.pretrain()?;
            if !report.status.is_success() {
                warn!(
                    status = %report.status,
                    "pseudo-likelihood training failed, continuing with its weights"
                );
            }
        }
        let report = self.train()?;
        if !report.status.is_success() {
            warn!(status = %report.status, "training ended early");
        }
        Ok((self.finish()?, report))
    }

    fn run(&mut self, objective: Objective, max_iterations: usize) -> Result<TrainReport> {
        self.prepare()?;
        let params = &self.params;
        let verbose = self.verbose;
        let Prepared {
            model,
            samples,
            max_len,
        } = self
            .state
            .as_mut()
            .ok_or_else(|| Error::invalid("no training data"))?;

        let mut lbfgs = params.lbfgs().clone();
        lbfgs.set_max_iterations(max_iterations)?;
        let sigma2 = match params.estimation() {
            Estimation::LbfgsL1 => {
                lbfgs.set_c1(params.l1_prior())?;
                None
            }
            Estimation::LbfgsL2 => {
                lbfgs.set_c1(0.0)?;
                Some(params.l2_prior()).filter(|&s| s > 0.0)
            }
        };

        let n = model.weights().len();
        let mut x = mem::take(model.weights_mut());
        let mut g = vec![0.0; n];
        let mut empirical = vec![0.0; n];
        if objective == Objective::Likelihood {
            model.empirical_counts(&mut empirical);
        }
        let mut ws = model.workspace(*max_len);
        let m: &M = &*model;
        let samples: &[M::Sample] = &samples[..];

        info!(
            objective = objective.name(),
            estimation = %params.estimation(),
            max_iterations,
            "start training"
        );

        let evaluate = |w: &[f64], grad: &mut [f64]| -> Result<f64> {
            let mut loss = 0.0;
            match objective {
                Objective::Likelihood => {
                    for (gi, e) in grad.iter_mut().zip(&empirical) {
                        *gi = -e;
                    }
                    for sample in samples {
                        m.calculate_factors(w, sample, &mut ws)?;
                        m.forward(&mut ws)?;
                        m.backward(&mut ws)?;
                        loss -= m.log_prob(sample, &ws);
                        m.gradient_contribution(sample, &mut ws, grad, 1.0)?;
                    }
                }
                Objective::PseudoLikelihood => {
                    grad.fill(0.0);
                    for sample in samples {
                        loss -= m.pseudo_log_likelihood(w, sample, &mut ws, grad)?;
                    }
                }
            }
            if let Some(s2) = sigma2 {
                for (gi, &wi) in grad.iter_mut().zip(w) {
                    *gi += wi / s2;
                    loss += wi * wi / (2.0 * s2);
                }
            }
            Ok(loss)
        };

        let mut history = Vec::new();
        let progress = |p: &Progress<'_>| -> bool {
            history.push(p.fx);
            if verbose {
                info!(
                    iteration = p.iteration,
                    loss = p.fx,
                    xnorm = p.xnorm,
                    gnorm = p.gnorm,
                    step = p.step,
                    "iteration"
                );
            } else {
                debug!(
                    iteration = p.iteration,
                    loss = p.fx,
                    xnorm = p.xnorm,
                    gnorm = p.gnorm,
                    step = p.step,
                    "iteration"
                );
            }
            false
        };

        let result = Lbfgs::new(lbfgs).minimize(&mut x, &mut g, evaluate, progress);
        *model.weights_mut() = x;
        let report = result?;

        info!(
            objective = objective.name(),
            status = %report.status,
            loss = report.fx,
            iterations = report.iterations,
            "finished training"
        );
        Ok(TrainReport {
            status: report.status,
            objective: report.fx,
            iterations: report.iterations,
            evaluations: report.evaluations,
            history,
        })
    }
}

impl Trainer<MaxEnt> {
    /// Create a new maximum-entropy classifier trainer
    pub fn maxent() -> Self {
        Self::new()
    }
}

impl Trainer<Crf> {
    /// Create a new linear-chain CRF trainer
    pub fn crf() -> Self {
        Self::new()
    }
}

impl Trainer<TriCrf1> {
    /// Create a new TriCRF1 trainer
    pub fn tricrf1() -> Self {
        Self::new()
    }
}

impl Trainer<TriCrf2> {
    /// Create a new TriCRF2 trainer
    pub fn tricrf2() -> Self {
        Self::new()
    }
}

impl<M: SequenceModel> Trainer<M> {
    /// Set the L1 prior and select OWL-QN (builder pattern)
    pub fn with_l1_prior(mut self, l1_prior: f64) -> Result<Self> {
        self.params.set_l1_prior(l1_prior)?;
        self.params.set_estimation(Estimation::LbfgsL1);
        Ok(self)
    }

    /// Set the L2 prior variance and select L-BFGS-L2 (builder pattern)
    pub fn with_l2_prior(mut self, l2_prior: f64) -> Result<Self> {
        self.params.set_l2_prior(l2_prior)?;
        self.params.set_estimation(Estimation::LbfgsL2);
        Ok(self)
    }

    /// Set maximum iterations (builder pattern)
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Result<Self> {
        self.params.set_max_iterations(max_iterations)?;
        Ok(self)
    }

    /// Enable pseudo-likelihood initialisation (builder pattern)
    pub fn with_pretraining(mut self, iterations: usize) -> Result<Self> {
        self.params.set_pretrain_iterations(iterations)?;
        self.params.set_pseudo_likelihood_init(true);
        Ok(self)
    }

    /// Tie rare transitions (builder pattern)
    pub fn with_tied_min_count(mut self, min_count: f64) -> Result<Self> {
        self.params.set_tied_min_count(Some(min_count))?;
        Ok(self)
    }

    /// Set convergence epsilon (builder pattern)
    pub fn with_epsilon(mut self, epsilon: f64) -> Result<Self> {
        self.params.lbfgs_mut().set_epsilon(epsilon)?;
        Ok(self)
    }
}

impl<M: SequenceModel> fmt::Debug for Trainer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("documents", &self.docs.len())
            .field("verbose", &self.verbose)
            .field("params", &self.params)
            .field("prepared", &self.state.is_some())
            .finish()
    }
}

impl<M: SequenceModel> Default for Trainer<M> {
    fn default() -> Self {
        Self::new()
    }
}
