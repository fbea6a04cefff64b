//! Text serialisation of a parameter store and its weights.
//!
//! ```text
//! // State ; <n>
//! <state name> x n
//! // Feature ; <n>
//! <feature name> x n
//! // Parameter ; <n>
//! <arity> <label id> ... x n
//! // Weight ; <n_weight>
//! <float> x n_weight
//! ```
//!
//! Several stores may follow each other in one file.

use std::io::Write;

use bstr::ByteSlice;

use super::{Param, ParamStore};
use crate::dictionary::Dictionary;
use crate::error::{Error, Result};

impl ParamStore {
    /// Write the store and its weight slice
    pub fn write_to<W: Write>(&self, weights: &[f64], writer: &mut W) -> Result<()> {
        if self.params.len() != self.features.len() {
            return Err(Error::model(format!(
                "parameter index has {} entries for {} features",
                self.params.len(),
                self.features.len()
            )));
        }
        if weights.len() != self.n_weight() {
            return Err(Error::model(format!(
                "expected {} weights, got {}",
                self.n_weight(),
                weights.len()
            )));
        }

        writeln!(writer, "// State ; {}", self.states.len())?;
        for (name, _) in self.states.iter() {
            writeln!(writer, "{}", name)?;
        }
        writeln!(writer, "// Feature ; {}", self.features.len())?;
        for (name, _) in self.features.iter() {
            writeln!(writer, "{}", name)?;
        }
        writeln!(writer, "// Parameter ; {}", self.params.len())?;
        for list in &self.params {
            write!(writer, "{}", list.len())?;
            for param in list {
                write!(writer, " {}", param.label)?;
            }
            writeln!(writer)?;
        }
        writeln!(writer, "// Weight ; {}", weights.len())?;
        for w in weights {
            // `{:e}` is the shortest representation that parses back exactly
            writeln!(writer, "{:e}", w)?;
        }
        Ok(())
    }
}

/// Line cursor over a model file holding one or more stores
pub(crate) struct ModelReader<'a> {
    lines: bstr::Lines<'a>,
    line: usize,
}

impl<'a> ModelReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self {
            lines: bytes.lines(),
            line: 0,
        }
    }

    fn next_line(&mut self, reading: &str) -> Result<&'a str> {
        let line = self.lines.next().ok_or_else(|| {
            Error::model(format!("unexpected end of file while reading {}", reading))
        })?;
        self.line += 1;
        line.to_str()
            .map_err(|_| Error::model(format!("line {}: invalid UTF-8", self.line)))
    }

    fn header(&mut self, section: &str) -> Result<usize> {
        let line = self.next_line(section)?;
        let mut tokens = line.split_whitespace();
        match (
            tokens.next(),
            tokens.next(),
            tokens.next(),
            tokens.next(),
            tokens.next(),
        ) {
            (Some("//"), Some(name), Some(";"), Some(count), None) if name == section => {
                count.parse().map_err(|_| {
                    Error::model(format!("line {}: invalid {} count", self.line, section))
                })
            }
            _ => Err(Error::model(format!(
                "line {}: expected '// {} ; <count>' header",
                self.line, section
            ))),
        }
    }

    fn dictionary(&mut self, section: &str) -> Result<Dictionary> {
        let n = self.header(section)?;
        let mut dict = Dictionary::new();
        for i in 0..n {
            let name = self.next_line(section)?;
            if dict.get_or_insert(name)? as usize != i {
                return Err(Error::model(format!(
                    "line {}: duplicate {} name '{}'",
                    self.line, section, name
                )));
            }
        }
        Ok(dict)
    }

    /// Read the next store and its weights
    pub(crate) fn read_store(&mut self) -> Result<(ParamStore, Vec<f64>)> {
        let states = self.dictionary("State")?;
        let features = self.dictionary("Feature")?;

        let n_params = self.header("Parameter")?;
        if n_params != features.len() {
            return Err(Error::model(format!(
                "line {}: {} parameter rows for {} features",
                self.line,
                n_params,
                features.len()
            )));
        }
        let mut params = Vec::with_capacity(n_params);
        let mut slot = 0u32;
        for _ in 0..n_params {
            let line = self.next_line("Parameter")?;
            let mut tokens = line.split_whitespace();
            let arity: usize = tokens
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| Error::model(format!("line {}: missing arity", self.line)))?;
            let mut list = Vec::with_capacity(arity);
            for token in tokens {
                let label: u32 = token.parse().map_err(|_| {
                    Error::model(format!("line {}: invalid label id '{}'", self.line, token))
                })?;
                if label as usize >= states.len() {
                    return Err(Error::model(format!(
                        "line {}: label id {} out of range",
                        self.line, label
                    )));
                }
                if list.last().map_or(false, |p: &Param| p.label >= label) {
                    return Err(Error::model(format!(
                        "line {}: label ids must be strictly increasing",
                        self.line
                    )));
                }
                list.push(Param { label, slot });
                slot += 1;
            }
            if list.len() != arity {
                return Err(Error::model(format!(
                    "line {}: expected {} label ids, found {}",
                    self.line,
                    arity,
                    list.len()
                )));
            }
            params.push(list);
        }

        let n_weight = self.header("Weight")?;
        if n_weight != slot as usize {
            return Err(Error::model(format!(
                "line {}: {} weights declared but the index has {} parameters",
                self.line, n_weight, slot
            )));
        }
        let mut weights = Vec::with_capacity(n_weight);
        for _ in 0..n_weight {
            let line = self.next_line("Weight")?;
            let w: f64 = line.trim().parse().map_err(|_| {
                Error::model(format!("line {}: invalid weight '{}'", self.line, line))
            })?;
            weights.push(w);
        }

        let store = ParamStore::from_parts(states, features, params, n_weight);
        Ok((store, weights))
    }

    /// Fail unless only blank lines remain
    pub(crate) fn finish(&mut self) -> Result<()> {
        for line in self.lines.by_ref() {
            self.line += 1;
            if !line.trim().is_empty() {
                return Err(Error::model(format!(
                    "line {}: trailing data after the last store",
                    self.line
                )));
            }
        }
        Ok(())
    }
}
