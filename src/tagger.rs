use std::fmt;
use std::io::Write;

use crate::attribute::Attribute;
use crate::dataset::{Document, Token};
use crate::error::{Error, Result};
use crate::model::SequenceModel;

/// Labelling of one document produced by a [`Tagger`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prediction {
    /// Predicted label of every token
    pub labels: Vec<String>,
    /// Predicted topic for triangular models
    pub topic: Option<String>,
    /// Posterior probability of the predicted topic
    pub topic_confidence: Option<f64>,
    /// Probability of the whole predicted assignment
    pub probability: f64,
    /// Marginal probability of each predicted label
    pub confidence: Vec<f64>,
}

impl Prediction {
    /// Write the prediction in the output file layout: the topic line for
    /// triangular models, one label per token, then a blank line. With
    /// `confidence` each line carries its probability after a tab.
    pub fn write_to<W: Write>(&self, writer: &mut W, confidence: bool) -> Result<()> {
        if let Some(topic) = &self.topic {
            match (confidence, self.topic_confidence) {
                (true, Some(p)) => writeln!(writer, "{}\t{}", topic, p)?,
                _ => writeln!(writer, "{}", topic)?,
            }
        }
        for (label, p) in self.labels.iter().zip(&self.confidence) {
            if confidence {
                writeln!(writer, "{}\t{}", label, p)?;
            } else {
                writeln!(writer, "{}", label)?;
            }
        }
        writeln!(writer)?;
        Ok(())
    }
}

/// The tagger predicts label sequences (and topics) for input documents
/// using a trained model. It owns the inference lattices so repeated calls
/// reuse their allocations.
pub struct Tagger<'a, M: SequenceModel> {
    model: &'a M,
    workspace: M::Workspace,
}

impl<M: SequenceModel> fmt::Debug for Tagger<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagger")
            .field("model_type", &M::MODEL_TYPE)
            .finish()
    }
}

impl<'a, M: SequenceModel> Tagger<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self {
            model,
            workspace: model.workspace(0),
        }
    }

    pub fn model(&self) -> &'a M {
        self.model
    }

    /// Predict the labelling of a document
    pub fn tag(&mut self, doc: &Document) -> Result<Prediction> {
        self.tag_with_likelihood(doc).map(|(prediction, _)| prediction)
    }

    /// Predict the labelling of a document and score its gold labels.
    ///
    /// The second value is `log P(gold | x)` under the model, which is
    /// [`LOG_ZERO`](crate::LOG_ZERO) when the gold labels are unknown to it.
    pub fn tag_with_likelihood(&mut self, doc: &Document) -> Result<(Prediction, f64)> {
        let model = self.model;
        let sample = model.encode(doc)?;
        model.calculate_factors(model.weights(), &sample, &mut self.workspace)?;
        model.forward(&mut self.workspace)?;
        model.backward(&mut self.workspace)?;
        let log_likelihood = model.log_prob(&sample, &self.workspace);
        let decoded = model.viterbi_search(&mut self.workspace)?;

        let mut labels = Vec::with_capacity(decoded.labels.len());
        let mut confidence = Vec::with_capacity(decoded.labels.len());
        for (t, &id) in decoded.labels.iter().enumerate() {
            let name = model
                .label_name(id)
                .ok_or_else(|| Error::model(format!("label id {} has no name", id)))?;
            labels.push(name.to_string());
            confidence.push(model.marginal(&self.workspace, t, id));
        }
        let (topic, topic_confidence) = match decoded.topic {
            Some(z) => {
                let name = model
                    .topic_name(z)
                    .ok_or_else(|| Error::model(format!("topic id {} has no name", z)))?;
                (
                    Some(name.to_string()),
                    Some(model.topic_marginal(&self.workspace, z)),
                )
            }
            None => (None, None),
        };
        let prediction = Prediction {
            labels,
            topic,
            topic_confidence,
            probability: decoded.probability,
            confidence,
        };
        Ok((prediction, log_likelihood))
    }

    /// Predict the label sequence for an item sequence
    pub fn tag_sequence<T: AsRef<[Attribute]>>(&mut self, xseq: &[T]) -> Result<Vec<String>> {
        if xseq.is_empty() {
            return Ok(Vec::new());
        }
        let doc = Document {
            topic: None,
            tokens: xseq
                .iter()
                .map(|item| Token::new("", item.as_ref().to_vec()))
                .collect(),
        };
        Ok(self.tag(&doc)?.labels)
    }
}
