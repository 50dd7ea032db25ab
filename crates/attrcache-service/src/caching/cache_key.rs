use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::{DomainId, Parameter, SourceId};

/// The key of a derived cache entry.
///
/// Two keys are equal when the hash of their metadata is equal. The metadata is a
/// human-readable, **stable** description of everything that went into the computation.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKeyBuilder`] for a computation of `domain` on `source`.
    pub fn builder(source: SourceId, domain: DomainId) -> CacheKeyBuilder {
        CacheKeyBuilder {
            metadata: format!("source: {source}\ndomain: {domain}\n"),
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKeyBuilder {
            metadata: key.into(),
        }
        .build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes the given parameters, in the order given, into the [`CacheKey`].
    ///
    /// Callers are expected to pass normalized parameters, see
    /// [`normalize_parameters`](crate::services::normalize_parameters).
    pub fn write_parameters(&mut self, parameters: &[Parameter]) -> fmt::Result {
        self.metadata.write_str("parameters:\n")?;
        for parameter in parameters {
            writeln!(
                self.metadata,
                "  {} {}",
                parameter.acronym,
                parameter.settings_key()
            )?;
        }
        Ok(())
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.metadata);

        CacheKey {
            metadata: self.metadata.into(),
            hash: hash.into(),
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_and_hash() {
        let mut builder = CacheKey::builder(SourceId(42), DomainId(1));
        builder
            .write_parameters(&[
                Parameter::new("CI"),
                Parameter::new("SC").with_setting("factor", serde_json::json!(1.5)),
            ])
            .unwrap();
        let key = builder.build();

        assert_eq!(
            key.metadata(),
            "source: 42\ndomain: 1\nparameters:\n  CI {}\n  SC {\"factor\":1.5}\n"
        );
        assert_eq!(key.to_string().len(), 64);
        assert_eq!(key, CacheKey::for_testing(key.metadata()));
    }

    #[test]
    fn test_distinct_inputs_distinct_keys() {
        let plain = CacheKey::builder(SourceId(42), DomainId(1)).build();
        let other_domain = CacheKey::builder(SourceId(42), DomainId(2)).build();
        let other_source = CacheKey::builder(SourceId(43), DomainId(1)).build();

        assert_ne!(plain, other_domain);
        assert_ne!(plain, other_source);
    }
}
