use std::collections::HashMap;

use crate::error::{Error, Result};

/// A bidirectional dictionary for mapping between strings and integer IDs
///
/// New entries can be added until the dictionary is sealed; afterwards it is
/// read-only and [`Dictionary::get_or_insert`] fails for unknown names.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    /// Map from string to ID
    str_to_id: HashMap<String, u32>,
    /// Map from ID to string
    id_to_str: Vec<String>,
    sealed: bool,
}

impl Dictionary {
    /// Create a new empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of entries in the dictionary
    pub fn len(&self) -> usize {
        self.id_to_str.len()
    }

    /// Returns `true` if the dictionary contains no entries
    pub fn is_empty(&self) -> bool {
        self.id_to_str.is_empty()
    }

    /// Returns `true` once the dictionary has been frozen
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Freeze the dictionary
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Get or create an ID for a string
    ///
    /// Returns the ID for the string, creating a new entry if it doesn't exist
    /// and the dictionary is still open.
    pub fn get_or_insert(&mut self, s: &str) -> Result<u32> {
        if let Some(&id) = self.str_to_id.get(s) {
            return Ok(id);
        }
        if self.sealed {
            return Err(Error::Sealed(s.to_string()));
        }
        let id = u32::try_from(self.id_to_str.len())
            .map_err(|_| Error::invalid("too many dictionary entries"))?;
        self.str_to_id.insert(s.to_string(), id);
        self.id_to_str.push(s.to_string());
        Ok(id)
    }

    /// Intern a reserved name regardless of the sealed state
    pub(crate) fn insert_reserved(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.str_to_id.get(s) {
            return id;
        }
        let id = self.id_to_str.len() as u32;
        self.str_to_id.insert(s.to_string(), id);
        self.id_to_str.push(s.to_string());
        id
    }

    /// Look up the ID of a string without inserting it
    pub fn get(&self, s: &str) -> Option<u32> {
        self.str_to_id.get(s).copied()
    }

    /// Look up the string for an ID
    pub fn name(&self, id: u32) -> Option<&str> {
        self.id_to_str.get(id as usize).map(String::as_str)
    }

    /// Iterate over all (string, id) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.id_to_str
            .iter()
            .enumerate()
            .map(|(id, s)| (s.as_str(), id as u32))
    }
}
