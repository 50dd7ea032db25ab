//! Types shared between the caches, the providers, and the HTTP interface.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one source document on the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u32);

impl SourceId {
    /// The well-known identifier of the "empty" source.
    ///
    /// Requests for it short-circuit to [`Attributes::empty`] without touching any cache.
    pub const EMPTY: SourceId = SourceId(0);

    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Selects the computation kind (see [`ProviderRegistry`](crate::services::ProviderRegistry)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(pub u32);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single computation parameter, such as a behavior toggle with optional settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub acronym: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl Parameter {
    pub fn new(acronym: impl Into<String>) -> Self {
        Self {
            acronym: acronym.into(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// A stable textual form of the settings, used for ordering and cache keys.
    ///
    /// `serde_json` maps are sorted, which makes this independent of insertion order.
    pub fn settings_key(&self) -> String {
        serde_json::to_string(&self.settings).unwrap_or_default()
    }
}

/// The request to compute [`Attributes`] for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributesRequest {
    #[serde(alias = "source_id")]
    pub source_id: SourceId,
    #[serde(alias = "domain_id")]
    pub domain_id: DomainId,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// The result of a domain computation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attributes {
    /// The headline number of the computation.
    pub rating: f64,
    /// Additional named values, specific to the computation kind.
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

impl Attributes {
    /// The sentinel result for empty, unknown, or broken inputs.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rating == 0.0 && self.values.is_empty()
    }
}
