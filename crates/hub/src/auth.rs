//! Sensor API keys. Each key may be bound to a single plot.

use subtle::ConstantTimeEq;

use crate::config::{normalize_plot_id, ApiKeyEntry};

/// Header carrying the sensor's key.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    Missing,
    Invalid,
    WrongPlot,
}

struct KeyEntry {
    key: Vec<u8>,
    plot_id: Option<String>,
}

pub struct ApiKeys {
    entries: Vec<KeyEntry>,
}

impl ApiKeys {
    pub fn from_config(entries: &[ApiKeyEntry]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|e| KeyEntry {
                    key: e.key.as_bytes().to_vec(),
                    plot_id: e.plot_id.as_deref().map(normalize_plot_id),
                })
                .collect(),
        }
    }

    /// No keys configured: ingestion is unauthenticated.
    pub fn is_open(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check that `presented` may post a reading for `plot_id`.
    pub fn authorize(&self, presented: Option<&str>, plot_id: &str) -> Result<(), AuthError> {
        if self.is_open() {
            return Ok(());
        }
        let presented = presented.ok_or(AuthError::Missing)?.as_bytes();

        // Compare against every key so timing does not reveal which matched.
        let mut matched: Option<&KeyEntry> = None;
        for entry in &self.entries {
            if bool::from(entry.key.as_slice().ct_eq(presented)) {
                matched = Some(entry);
            }
        }

        match matched {
            None => Err(AuthError::Invalid),
            Some(KeyEntry {
                plot_id: Some(bound),
                ..
            }) if bound != plot_id => Err(AuthError::WrongPlot),
            Some(_) => Ok(()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
