//! Manifest filters (`expo-manifest-filters`).

use super::Manifest;
use crate::error::{Error, Result};
use crate::headers::parse_dictionary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key/value filters evaluated against manifest metadata.
///
/// A manifest passes when every filter key that appears in its metadata
/// carries the filtered value. Keys absent from the metadata pass, so a
/// server can add new filter dimensions without invalidating old updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionFilters(BTreeMap<String, String>);

impl SelectionFilters {
    /// Empty filter set; matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `expo-manifest-filters` structured header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestParse`] if the header is malformed.
    pub fn from_header(header: &str) -> Result<Self> {
        let dict = parse_dictionary(header)
            .map_err(|e| Error::ManifestParse(format!("manifest filters: {e}")))?;
        Ok(Self(
            dict.into_iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect(),
        ))
    }

    /// Add a filter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Whether no filters are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over filter entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the manifest satisfies every filter.
    #[must_use]
    pub fn matches(&self, manifest: &Manifest) -> bool {
        self.0.iter().all(|(key, expected)| {
            manifest
                .metadata_string(key)
                .map_or(true, |actual| &actual == expected)
        })
    }
}

impl FromIterator<(String, String)> for SelectionFilters {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
