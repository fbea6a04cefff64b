//! Run configuration files.
//!
//! A configuration file holds one `key = value ...` entry per line; keys and
//! values are separated by spaces, tabs or `=`, and lines starting with `#`
//! are comments. A value of the form `name[a-b]suffix` expands to
//! `name{a}suffix` through `name{b}suffix`:
//!
//! ```text
//! model_type = TriCRF2
//! mode = both
//! train_file = data/train[1-3].txt
//! model_file = model[1-3]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::ModelType;
use crate::train::TrainParams;

/// Raw `key -> values` entries of a configuration file
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: HashMap<String, Vec<String>>,
    path: Option<PathBuf>,
}

impl Config {
    /// Parse configuration text. The first entry of a repeated key wins.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line
                .split(|c| c == ' ' || c == '=' || c == '\t')
                .filter(|t| !t.is_empty());
            let key = match tokens.next() {
                Some(key) => key,
                None => continue,
            };
            let mut values = Vec::new();
            for token in tokens {
                values.extend(expand(token).map_err(|e| {
                    Error::Config(format!("line {}: {}", i + 1, e))
                })?);
            }
            if values.is_empty() {
                return Err(Error::Config(format!(
                    "line {}: '{}' has no value",
                    i + 1,
                    key
                )));
            }
            entries.entry(key.to_string()).or_insert(values);
        }
        Ok(Self {
            entries,
            path: None,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let mut config = Self::parse(&text)?;
        config.path = Some(path.as_ref().to_path_buf());
        Ok(config)
    }

    /// File the configuration was read from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// First value of a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values of a key, empty when absent
    pub fn gets(&self, key: &str) -> &[String] {
        self.entries.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn parse_value<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| Error::Config(format!("invalid value '{}' for {}", v, key)))
            })
            .transpose()
    }
}

/// Largest number of names one `[a-b]` range may expand to
const MAX_RANGE: usize = 10_000;

/// Expand a `name[a-b]suffix` token
fn expand(token: &str) -> std::result::Result<Vec<String>, String> {
    let (name, rest) = match token.split_once('[') {
        Some(parts) => parts,
        None => return Ok(vec![token.to_string()]),
    };
    let (range, suffix) = rest
        .split_once(']')
        .ok_or_else(|| format!("unterminated range in '{}'", token))?;
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| format!("invalid range in '{}'", token))?;
    let start: usize = start
        .trim()
        .parse()
        .map_err(|_| format!("invalid range in '{}'", token))?;
    let end: usize = end
        .trim()
        .parse()
        .map_err(|_| format!("invalid range in '{}'", token))?;
    if start > end {
        return Err(format!("empty range in '{}'", token));
    }
    if end - start >= MAX_RANGE {
        return Err(format!(
            "range in '{}' expands to more than {} names",
            token, MAX_RANGE
        ));
    }
    Ok((start..=end)
        .map(|i| format!("{}{}{}", name, i, suffix))
        .collect())
}

/// What a run does with its file lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Test,
    Both,
}

impl Mode {
    pub fn trains(self) -> bool {
        matches!(self, Mode::Train | Mode::Both)
    }

    pub fn tests(self) -> bool {
        matches!(self, Mode::Test | Mode::Both)
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Mode::Train),
            "test" => Ok(Mode::Test),
            "both" => Ok(Mode::Both),
            _ => Err(Error::Config(format!("unknown mode '{}'", s))),
        }
    }
}

/// Keys understood by [`RunConfig`] besides the training parameter names
const RUN_KEYS: &[&str] = &[
    "model_type",
    "mode",
    "train_file",
    "dev_file",
    "test_file",
    "model_file",
    "output_file",
    "confidence",
    "prune",
    "iter",
    "initialize",
    "initialize_iter",
    "log_file",
    "log_mode",
];

/// Decoding beam used when the configuration does not set `prune`
pub const DEFAULT_PRUNE: f64 = 1000.0;

/// A validated run configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub model_type: ModelType,
    pub mode: Mode,
    pub train_files: Vec<PathBuf>,
    pub dev_files: Vec<PathBuf>,
    pub test_files: Vec<PathBuf>,
    pub model_files: Vec<PathBuf>,
    pub output_files: Vec<PathBuf>,
    /// Write marginal probabilities next to the predicted labels
    pub confidence: bool,
    /// Topic beam used while decoding triangular models
    pub prune: f64,
    pub params: TrainParams,
    pub log_file: Option<PathBuf>,
}

fn paths(config: &Config, key: &str) -> Vec<PathBuf> {
    config.gets(key).iter().map(PathBuf::from).collect()
}

impl RunConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        for key in config.keys() {
            if !RUN_KEYS.contains(&key) && !TrainParams::NAMES.contains(&key) {
                return Err(Error::Config(format!("unknown key '{}'", key)));
            }
        }
        let model_type: ModelType = config
            .get("model_type")
            .ok_or_else(|| Error::Config("model_type is not set".to_string()))?
            .parse()?;
        let mode = config.parse_value("mode")?.unwrap_or(Mode::Both);

        let mut params = TrainParams::default();
        for key in config.keys() {
            if TrainParams::NAMES.contains(&key) {
                params
                    .set(key, &config.gets(key).join(" "))
                    .map_err(|e| Error::Config(e.to_string()))?;
            }
        }
        if let Some(iter) = config.parse_value("iter")? {
            params
                .set_max_iterations(iter)
                .map_err(|e| Error::Config(e.to_string()))?;
        }
        match config.get("initialize") {
            None => {}
            Some("PL") => params.set_pseudo_likelihood_init(true),
            Some(other) => {
                return Err(Error::Config(format!(
                    "unknown initialization '{}'",
                    other
                )))
            }
        }
        if let Some(iter) = config.parse_value("initialize_iter")? {
            params
                .set_pretrain_iterations(iter)
                .map_err(|e| Error::Config(e.to_string()))?;
        }

        let run = Self {
            model_type,
            mode,
            train_files: paths(config, "train_file"),
            dev_files: paths(config, "dev_file"),
            test_files: paths(config, "test_file"),
            model_files: paths(config, "model_file"),
            output_files: paths(config, "output_file"),
            confidence: config.get("confidence") == Some("true"),
            prune: config.parse_value("prune")?.unwrap_or(DEFAULT_PRUNE),
            params,
            log_file: config.get("log_file").map(PathBuf::from),
        };
        run.validate()?;
        Ok(run)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_config(&Config::from_file(path)?)
    }

    fn validate(&self) -> Result<()> {
        let check = |what: &str, files: &[PathBuf], expected: usize| {
            if files.len() != expected {
                Err(Error::Config(format!(
                    "{} lists {} files but model_file lists {}",
                    what,
                    files.len(),
                    expected
                )))
            } else {
                Ok(())
            }
        };
        let n = self.model_files.len();
        if n == 0 {
            return Err(Error::Config("model_file is not set".to_string()));
        }
        if self.mode.trains() {
            check("train_file", &self.train_files, n)?;
            if !self.dev_files.is_empty() {
                check("dev_file", &self.dev_files, n)?;
            }
        }
        if self.mode.tests() {
            check("test_file", &self.test_files, n)?;
            if !self.output_files.is_empty() {
                check("output_file", &self.output_files, n)?;
            }
        }
        if !(self.prune >= 0.0) {
            return Err(Error::Config("prune must be non-negative".to_string()));
        }
        Ok(())
    }
}
