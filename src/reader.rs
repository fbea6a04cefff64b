//! Reader for the line-oriented data format.
//!
//! Every non-blank line holds one event, `label obs1:val1 obs2 ...`, and a
//! blank line ends a sequence. In a triangular corpus the first event of a
//! sequence is its topic. Lines starting with `#` are skipped.

use std::fs;
use std::path::Path;

use bstr::ByteSlice;

use crate::attribute::Attribute;
use crate::dataset::{Document, Token, TopicEvent};
use crate::error::{Error, Result};

/// Parses documents out of data files
#[derive(Debug, Clone, Copy, Default)]
pub struct DataReader {
    triangular: bool,
}

impl DataReader {
    /// Reader for chain corpora
    pub fn chain() -> Self {
        Self { triangular: false }
    }

    /// Reader for corpora whose sequences start with a topic event
    pub fn triangular() -> Self {
        Self { triangular: true }
    }

    pub fn is_triangular(&self) -> bool {
        self.triangular
    }

    pub fn read_file<P: AsRef<Path>>(&self, path: P) -> Result<Vec<Document>> {
        let bytes = fs::read(path)?;
        self.read(&bytes)
    }

    pub fn read(&self, bytes: &[u8]) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        let mut current: Option<Document> = None;
        for (i, line) in bytes.lines().enumerate() {
            let lineno = i + 1;
            let line = line.trim();
            if line.is_empty() {
                docs.extend(current.take());
                continue;
            }
            if line.starts_with(b"#") {
                continue;
            }
            let line = line.to_str().map_err(|_| Error::Data {
                line: lineno,
                message: "invalid UTF-8".to_string(),
            })?;
            let (label, attrs) = parse_event(line, lineno)?;
            match current.as_mut() {
                Some(doc) => doc.tokens.push(Token::new(label, attrs)),
                None if self.triangular => {
                    current = Some(Document {
                        topic: Some(TopicEvent::new(label, attrs)),
                        tokens: Vec::new(),
                    });
                }
                None => {
                    current = Some(Document {
                        topic: None,
                        tokens: vec![Token::new(label, attrs)],
                    });
                }
            }
        }
        docs.extend(current);
        Ok(docs)
    }
}

fn parse_event(line: &str, lineno: usize) -> Result<(&str, Vec<Attribute>)> {
    let mut fields = line.split_whitespace();
    let label = fields.next().ok_or_else(|| Error::Data {
        line: lineno,
        message: "missing label".to_string(),
    })?;
    let mut attrs = Vec::new();
    for field in fields {
        let attr = Attribute::parse(field);
        if !attr.value.is_finite() {
            return Err(Error::Data {
                line: lineno,
                message: format!("non-finite value in '{}'", field),
            });
        }
        attrs.push(attr);
    }
    Ok((label, attrs))
}
