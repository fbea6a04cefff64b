//! Accuracy, chunk-level precision/recall/F1 and log-likelihood of a
//! labelled test set.

use std::collections::BTreeMap;

use tracing::info;

use crate::error::{clamp_log, Error, Result};

/// Label marking tokens outside every chunk
pub const OUTSIDE_LABEL: &str = "O";

/// Chunk counts of one class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts {
    /// Chunks in the reference
    pub truth: usize,
    /// Chunks in the hypothesis
    pub guess: usize,
    /// Hypothesis chunks matching a reference chunk exactly
    pub correct: usize,
}

impl ClassCounts {
    pub fn precision(&self) -> f64 {
        ratio(self.correct, self.guess)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.correct, self.truth)
    }

    pub fn f1(&self) -> f64 {
        f1(self.precision(), self.recall())
    }
}

/// Precision, recall and their harmonic mean, all in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Scores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

/// A labelled span `[start, end]` of tokens
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Chunk<'a> {
    pub start: usize,
    pub end: usize,
    pub class: &'a str,
}

/// Split a label sequence into chunks.
///
/// `B-X` opens a chunk of class `X` and `I-X` continues an open chunk of the
/// same class (or opens one). Labels without a BIO prefix form one chunk per
/// token and [`OUTSIDE_LABEL`] closes the open chunk.
pub fn chunks<S: AsRef<str>>(labels: &[S]) -> Vec<Chunk<'_>> {
    let mut out = Vec::new();
    let mut open: Option<Chunk<'_>> = None;
    for (i, label) in labels.iter().enumerate() {
        let label = label.as_ref();
        if label == OUTSIDE_LABEL {
            out.extend(open.take());
            continue;
        }
        if let Some(class) = label.strip_prefix("I-") {
            match open.as_mut() {
                Some(chunk) if chunk.class == class => {
                    chunk.end = i;
                    continue;
                }
                _ => {}
            }
            out.extend(open.replace(Chunk {
                start: i,
                end: i,
                class,
            }));
            continue;
        }
        let class = label.strip_prefix("B-").unwrap_or(label);
        out.extend(open.replace(Chunk {
            start: i,
            end: i,
            class,
        }));
    }
    out.extend(open);
    out
}

/// Accumulates evaluation statistics over a test set.
///
/// With BIO chunking enabled scores are computed over chunks, otherwise
/// every token is its own chunk. The outside class never counts towards
/// precision and recall.
#[derive(Debug, Clone)]
pub struct Evaluator {
    bio: bool,
    correct: usize,
    events: usize,
    sequences: usize,
    topic_correct: usize,
    topic_events: usize,
    log_likelihood: f64,
    classes: BTreeMap<String, ClassCounts>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Evaluator {
    pub fn new(bio: bool) -> Self {
        Self {
            bio,
            correct: 0,
            events: 0,
            sequences: 0,
            topic_correct: 0,
            topic_events: 0,
            log_likelihood: 0.0,
            classes: BTreeMap::new(),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.bio);
    }

    /// Add one reference/hypothesis pair of label sequences
    pub fn append<R, H>(&mut self, reference: &[R], hypothesis: &[H]) -> Result<()>
    where
        R: AsRef<str>,
        H: AsRef<str>,
    {
        if reference.len() != hypothesis.len() {
            return Err(Error::invalid(format!(
                "reference has {} labels but hypothesis has {}",
                reference.len(),
                hypothesis.len()
            )));
        }
        self.sequences += 1;
        self.events += reference.len();
        self.correct += reference
            .iter()
            .zip(hypothesis)
            .filter(|(r, h)| r.as_ref() == h.as_ref())
            .count();

        let (truth, guess) = if self.bio {
            (chunks(reference), chunks(hypothesis))
        } else {
            (token_chunks(reference), token_chunks(hypothesis))
        };
        for chunk in &truth {
            self.counts(chunk.class).truth += 1;
        }
        for chunk in &guess {
            self.counts(chunk.class).guess += 1;
        }
        // Both lists are sorted by position and non-overlapping
        let (mut i, mut j) = (0, 0);
        while i < truth.len() && j < guess.len() {
            let (r, h) = (&truth[i], &guess[j]);
            if r.end < h.start {
                i += 1;
            } else if h.end < r.start {
                j += 1;
            } else {
                if r == h {
                    self.counts(r.class).correct += 1;
                }
                i += 1;
                j += 1;
            }
        }
        Ok(())
    }

    /// Add the reference and predicted topic of a triangular sample
    pub fn append_topic(&mut self, reference: &str, hypothesis: &str) {
        self.topic_events += 1;
        if reference == hypothesis {
            self.topic_correct += 1;
        }
    }

    /// Add `log P(gold | x)` of one sample
    pub fn add_log_likelihood(&mut self, log_prob: f64) {
        self.log_likelihood += clamp_log(log_prob);
    }

    fn counts(&mut self, class: &str) -> &mut ClassCounts {
        self.classes.entry(class.to_string()).or_default()
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences
    }

    pub fn num_events(&self) -> usize {
        self.events
    }

    /// Fraction of tokens labelled correctly
    pub fn accuracy(&self) -> f64 {
        ratio(self.correct, self.events)
    }

    /// Fraction of topics predicted correctly, `None` without topics
    pub fn topic_accuracy(&self) -> Option<f64> {
        (self.topic_events > 0).then(|| ratio(self.topic_correct, self.topic_events))
    }

    /// Summed log-likelihood of the gold assignments
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Counts of every class except the outside class
    pub fn classes(&self) -> impl Iterator<Item = (&str, &ClassCounts)> {
        self.classes
            .iter()
            .filter(|(name, _)| name.as_str() != OUTSIDE_LABEL)
            .map(|(name, counts)| (name.as_str(), counts))
    }

    /// Scores from the counts summed over classes
    pub fn micro(&self) -> Scores {
        let total = self
            .classes()
            .fold(ClassCounts::default(), |acc, (_, c)| ClassCounts {
                truth: acc.truth + c.truth,
                guess: acc.guess + c.guess,
                correct: acc.correct + c.correct,
            });
        Scores {
            precision: total.precision(),
            recall: total.recall(),
            f1: total.f1(),
        }
    }

    /// Mean per-class precision and recall; F1 is taken of the means
    pub fn macro_average(&self) -> Scores {
        let mut n = 0usize;
        let (mut precision, mut recall) = (0.0, 0.0);
        for (_, counts) in self.classes() {
            precision += counts.precision();
            recall += counts.recall();
            n += 1;
        }
        if n == 0 {
            return Scores::default();
        }
        let precision = precision / n as f64;
        let recall = recall / n as f64;
        Scores {
            precision,
            recall,
            f1: f1(precision, recall),
        }
    }

    /// Log the summary and the per-class scores
    pub fn report(&self, name: &str) {
        let micro = self.micro();
        let macro_avg = self.macro_average();
        info!(
            set = name,
            sequences = self.sequences,
            log_likelihood = self.log_likelihood,
            accuracy = format_args!("{:.2}%", 100.0 * self.accuracy()),
            precision = format_args!("{:.2}%", 100.0 * micro.precision),
            recall = format_args!("{:.2}%", 100.0 * micro.recall),
            f1 = format_args!("{:.2}", 100.0 * micro.f1),
            macro_f1 = format_args!("{:.2}", 100.0 * macro_avg.f1),
            "evaluation"
        );
        if let Some(accuracy) = self.topic_accuracy() {
            info!(
                set = name,
                topic_accuracy = format_args!("{:.2}%", 100.0 * accuracy),
                "topic evaluation"
            );
        }
        for (class, counts) in self.classes() {
            info!(
                class,
                precision = format_args!("{:.2}%", 100.0 * counts.precision()),
                recall = format_args!("{:.2}%", 100.0 * counts.recall()),
                f1 = format_args!("{:.2}", 100.0 * counts.f1()),
            );
        }
    }
}

fn token_chunks<S: AsRef<str>>(labels: &[S]) -> Vec<Chunk<'_>> {
    labels
        .iter()
        .enumerate()
        .filter(|(_, l)| l.as_ref() != OUTSIDE_LABEL)
        .map(|(i, l)| Chunk {
            start: i,
            end: i,
            class: l.as_ref(),
        })
        .collect()
}
