use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::optimize::{LbfgsParams, LineSearch};

/// Regularisation used by the quasi-Newton estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Estimation {
    /// OWL-QN with `c1 = l1_prior`
    LbfgsL1,
    /// L-BFGS with a Gaussian prior of variance `l2_prior`
    #[default]
    LbfgsL2,
}

impl Estimation {
    pub fn as_str(self) -> &'static str {
        match self {
            Estimation::LbfgsL1 => "LBFGS-L1",
            Estimation::LbfgsL2 => "LBFGS-L2",
        }
    }
}

impl FromStr for Estimation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LBFGS-L1" => Ok(Estimation::LbfgsL1),
            "LBFGS-L2" => Ok(Estimation::LbfgsL2),
            _ => Err(Error::invalid(format!("unknown estimation method '{}'", s))),
        }
    }
}

impl fmt::Display for Estimation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Training parameters.
///
/// Every parameter has a typed setter and is also reachable by name through
/// [`set`](Self::set) / [`get`](Self::get); see [`TrainParams::NAMES`].
#[derive(Debug, Clone)]
pub struct TrainParams {
    estimation: Estimation,
    l1_prior: f64,
    l2_prior: f64,
    max_iterations: usize,
    pseudo_likelihood_init: bool,
    pretrain_iterations: usize,
    tied_min_count: Option<f64>,
    active_threshold: Option<f64>,
    lbfgs: LbfgsParams,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            estimation: Estimation::default(),
            l1_prior: 0.0,
            l2_prior: 0.0,
            max_iterations: 100,
            pseudo_likelihood_init: false,
            pretrain_iterations: 30,
            tied_min_count: None,
            active_threshold: None,
            lbfgs: LbfgsParams::default(),
        }
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid(format!("invalid value '{}' for {}", value, name)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "true" | "1" | "yes" | "PL" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(Error::invalid(format!("invalid value '{}' for {}", value, name))),
    }
}

/// `none` (or an empty value) clears an optional threshold
fn parse_optional(name: &str, value: &str) -> Result<Option<f64>> {
    match value.trim() {
        "" | "none" => Ok(None),
        v => parse(name, v).map(Some),
    }
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "none".to_string(), |v| v.to_string())
}

impl TrainParams {
    /// Names accepted by [`set`](Self::set) and [`get`](Self::get)
    pub const NAMES: &'static [&'static str] = &[
        "estimation",
        "l1_prior",
        "l2_prior",
        "max_iterations",
        "pseudo_likelihood_init",
        "pretrain_iterations",
        "tied_min_count",
        "active_threshold",
        "num_memories",
        "epsilon",
        "period",
        "delta",
        "linesearch",
        "max_linesearch",
    ];

    pub fn estimation(&self) -> Estimation {
        self.estimation
    }

    pub fn set_estimation(&mut self, estimation: Estimation) {
        self.estimation = estimation;
    }

    pub fn l1_prior(&self) -> f64 {
        self.l1_prior
    }

    pub fn set_l1_prior(&mut self, l1_prior: f64) -> Result<()> {
        if !(l1_prior >= 0.0) {
            return Err(Error::invalid("l1_prior must be non-negative"));
        }
        self.l1_prior = l1_prior;
        Ok(())
    }

    /// Variance of the Gaussian prior; 0 disables L2 regularisation
    pub fn l2_prior(&self) -> f64 {
        self.l2_prior
    }

    pub fn set_l2_prior(&mut self, l2_prior: f64) -> Result<()> {
        if !(l2_prior >= 0.0) {
            return Err(Error::invalid("l2_prior must be non-negative"));
        }
        self.l2_prior = l2_prior;
        Ok(())
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) -> Result<()> {
        if max_iterations < 1 {
            return Err(Error::invalid("max_iterations must be at least 1"));
        }
        self.max_iterations = max_iterations;
        Ok(())
    }

    /// Whether [`Trainer::fit`](super::Trainer::fit) starts with
    /// pseudo-likelihood training
    pub fn pseudo_likelihood_init(&self) -> bool {
        self.pseudo_likelihood_init
    }

    pub fn set_pseudo_likelihood_init(&mut self, enabled: bool) {
        self.pseudo_likelihood_init = enabled;
    }

    pub fn pretrain_iterations(&self) -> usize {
        self.pretrain_iterations
    }

    pub fn set_pretrain_iterations(&mut self, iterations: usize) -> Result<()> {
        if iterations < 1 {
            return Err(Error::invalid("pretrain_iterations must be at least 1"));
        }
        self.pretrain_iterations = iterations;
        Ok(())
    }

    /// Minimum count for a transition to keep its own weight
    pub fn tied_min_count(&self) -> Option<f64> {
        self.tied_min_count
    }

    pub fn set_tied_min_count(&mut self, min_count: Option<f64>) -> Result<()> {
        if let Some(c) = min_count {
            if !(c >= 0.0) {
                return Err(Error::invalid("tied_min_count must be non-negative"));
            }
        }
        self.tied_min_count = min_count;
        Ok(())
    }

    /// Threshold of the active transition index built after training
    pub fn active_threshold(&self) -> Option<f64> {
        self.active_threshold
    }

    pub fn set_active_threshold(&mut self, threshold: Option<f64>) -> Result<()> {
        if let Some(t) = threshold {
            if !(t >= 0.0) {
                return Err(Error::invalid("active_threshold must be non-negative"));
            }
        }
        self.active_threshold = threshold;
        Ok(())
    }

    /// Optimiser settings; `c1` and `max_iterations` are overridden per run
    pub fn lbfgs(&self) -> &LbfgsParams {
        &self.lbfgs
    }

    pub fn lbfgs_mut(&mut self) -> &mut LbfgsParams {
        &mut self.lbfgs
    }

    /// Set a parameter from its string form
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "estimation" => self.set_estimation(value.trim().parse()?),
            "l1_prior" => self.set_l1_prior(parse(name, value)?)?,
            "l2_prior" => self.set_l2_prior(parse(name, value)?)?,
            "max_iterations" => self.set_max_iterations(parse(name, value)?)?,
            "pseudo_likelihood_init" => {
                self.set_pseudo_likelihood_init(parse_bool(name, value)?)
            }
            "pretrain_iterations" => self.set_pretrain_iterations(parse(name, value)?)?,
            "tied_min_count" => self.set_tied_min_count(parse_optional(name, value)?)?,
            "active_threshold" => self.set_active_threshold(parse_optional(name, value)?)?,
            "num_memories" => self.lbfgs.set_num_memories(parse(name, value)?)?,
            "epsilon" => self.lbfgs.set_epsilon(parse(name, value)?)?,
            "period" => self.lbfgs.set_period(parse(name, value)?),
            "delta" => self.lbfgs.set_delta(parse(name, value)?)?,
            "linesearch" => self.lbfgs.set_linesearch(value.trim().parse::<LineSearch>()?),
            "max_linesearch" => self.lbfgs.set_max_linesearch(parse(name, value)?)?,
            _ => return Err(Error::invalid(format!("unknown parameter '{}'", name))),
        }
        Ok(())
    }

    /// Current value of a parameter in string form
    pub fn get(&self, name: &str) -> Result<String> {
        Ok(match name {
            "estimation" => self.estimation.to_string(),
            "l1_prior" => self.l1_prior.to_string(),
            "l2_prior" => self.l2_prior.to_string(),
            "max_iterations" => self.max_iterations.to_string(),
            "pseudo_likelihood_init" => self.pseudo_likelihood_init.to_string(),
            "pretrain_iterations" => self.pretrain_iterations.to_string(),
            "tied_min_count" => format_optional(self.tied_min_count),
            "active_threshold" => format_optional(self.active_threshold),
            "num_memories" => self.lbfgs.num_memories().to_string(),
            "epsilon" => self.lbfgs.epsilon().to_string(),
            "period" => self.lbfgs.period().to_string(),
            "delta" => self.lbfgs.delta().to_string(),
            "linesearch" => self.lbfgs.linesearch().as_str().to_string(),
            "max_linesearch" => self.lbfgs.max_linesearch().to_string(),
            _ => return Err(Error::invalid(format!("unknown parameter '{}'", name))),
        })
    }
}
