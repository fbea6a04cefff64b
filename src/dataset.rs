use crate::attribute::Attribute;

/// An observation consists of a feature id with its value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Feature id
    pub id: u32,
    /// Value of the observation ("fval")
    pub value: f64,
}

impl Observation {
    pub fn new(id: u32, value: f64) -> Self {
        Self { id, value }
    }
}

/// An item consists of an array of observations
pub type Item = Vec<Observation>;

/// A sequence of items and labels, the unit of dynamic programming.
///
/// `labels` is either empty (unlabelled input) or as long as `items`.
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    /// Array of the item sequence
    pub items: Vec<Item>,
    /// Array of the label sequence
    pub labels: Vec<u32>,
}

impl Sequence {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            items: Vec::with_capacity(cap),
            labels: Vec::with_capacity(cap),
        }
    }

    pub fn push(&mut self, item: Item, label: u32) {
        self.items.push(item);
        self.labels.push(label);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_labeled(&self) -> bool {
        !self.items.is_empty() && self.labels.len() == self.items.len()
    }
}

/// One labelled token of a [`Document`]
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub label: String,
    pub attrs: Vec<Attribute>,
}

impl Token {
    pub fn new<S: Into<String>>(label: S, attrs: Vec<Attribute>) -> Self {
        Self {
            label: label.into(),
            attrs,
        }
    }
}

/// The document-level topic event of a triangular corpus
#[derive(Debug, Clone, PartialEq)]
pub struct TopicEvent {
    pub label: String,
    pub attrs: Vec<Attribute>,
}

impl TopicEvent {
    pub fn new<S: Into<String>>(label: S, attrs: Vec<Attribute>) -> Self {
        Self {
            label: label.into(),
            attrs,
        }
    }
}

/// String-level sequence as read from a data file
///
/// Chain models ignore `topic`; triangular models require it for training.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub topic: Option<TopicEvent>,
    pub tokens: Vec<Token>,
}

impl Document {
    /// Build a document from parallel observation and label sequences
    pub fn from_sequence<I, L>(xseq: &[I], yseq: &[L]) -> Self
    where
        I: AsRef<[Attribute]>,
        L: AsRef<str>,
    {
        let tokens = xseq
            .iter()
            .zip(yseq.iter())
            .map(|(x, y)| Token::new(y.as_ref(), x.as_ref().to_vec()))
            .collect();
        Self {
            topic: None,
            tokens,
        }
    }

    /// Attach a topic event
    pub fn with_topic(mut self, topic: TopicEvent) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Gold labels of the tokens
    pub fn labels(&self) -> Vec<&str> {
        self.tokens.iter().map(|t| t.label.as_str()).collect()
    }
}
