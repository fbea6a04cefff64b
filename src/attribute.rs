/// Prefix reserved for pseudo-features (previous-label, remainder, topic-label)
pub(crate) const RESERVED_PREFIX: char = '@';

/// Tuple of observation name and its value
///
/// This type is used for both training and prediction (tagging).
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Observation name
    pub name: String,
    /// Value of the observation
    pub value: f64,
}

impl Attribute {
    /// Create a new attribute with a name and value
    pub fn new<T: Into<String>>(name: T, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Parse a data-file token of the form `name:value` or `name`.
    ///
    /// The value is split off at the last colon; if it does not parse as a
    /// float the whole token is the name and the value defaults to 1.0.
    pub fn parse(token: &str) -> Self {
        if let Some((name, value)) = token.rsplit_once(':') {
            if !name.is_empty() {
                if let Ok(value) = value.parse::<f64>() {
                    return Self::new(name, value);
                }
            }
        }
        Self::new(token, 1.0)
    }

    pub(crate) fn is_reserved(&self) -> bool {
        self.name.starts_with(RESERVED_PREFIX)
    }
}

impl From<String> for Attribute {
    fn from(name: String) -> Self {
        Self { name, value: 1.0 }
    }
}

impl From<&str> for Attribute {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: 1.0,
        }
    }
}

impl<S: Into<String>> From<(S, f64)> for Attribute {
    fn from((name, value): (S, f64)) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}
