//! Domain computations that turn a source document into [`Attributes`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::caching::ComputationError;
use crate::types::{Attributes, DomainId, Parameter};

/// A computation kind, selected by [`DomainId`].
///
/// Providers are pure with respect to caching: they are handed the source document and the
/// normalized parameters and must not keep any state between calls.
pub trait ComputationProvider: fmt::Debug + Send + Sync + 'static {
    /// A human readable name, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// The parameter acronyms this provider understands.
    fn known_parameters(&self) -> &'static [&'static str];

    /// A neutral document used to find out which parameters affect the outcome.
    fn baseline(&self) -> Bytes;

    /// Computes the attributes of `source`.
    fn compute(
        &self,
        source: &[u8],
        parameters: &[Parameter],
    ) -> Result<Attributes, ComputationError>;
}

/// The table of available computation kinds.
///
/// It is populated once at startup and immutable afterwards.
#[derive(Clone, Debug)]
pub struct ProviderRegistry {
    providers: Arc<BTreeMap<DomainId, Arc<dyn ComputationProvider>>>,
}

impl ProviderRegistry {
    pub fn new(
        providers: impl IntoIterator<Item = (DomainId, Arc<dyn ComputationProvider>)>,
    ) -> Self {
        Self {
            providers: Arc::new(providers.into_iter().collect()),
        }
    }

    /// The built-in computation kinds.
    ///
    /// - `0`: line statistics of a text document
    /// - `1`: word statistics of a text document
    pub fn builtin() -> Self {
        Self::new([
            (
                DomainId(0),
                Arc::new(TextStatsProvider::new(TextStat::Lines)) as Arc<dyn ComputationProvider>,
            ),
            (
                DomainId(1),
                Arc::new(TextStatsProvider::new(TextStat::Words)) as Arc<dyn ComputationProvider>,
            ),
        ])
    }

    pub fn get(&self, domain: DomainId) -> Option<&Arc<dyn ComputationProvider>> {
        self.providers.get(&domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = DomainId> + '_ {
        self.providers.keys().copied()
    }
}

/// What a [`TextStatsProvider`] counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextStat {
    Lines,
    Words,
}

/// Computes simple statistics of UTF-8 text documents.
///
/// Understood parameters:
/// - `SC`: scales the rating by the `factor` setting, `2.0` if absent.
/// - `CI`: compares words case-insensitively.
/// - `NB`: ignores blank lines.
#[derive(Clone, Debug)]
pub struct TextStatsProvider {
    stat: TextStat,
}

#[derive(Debug)]
struct TextOptions {
    scale: f64,
    case_insensitive: bool,
    skip_blank: bool,
}

impl TextOptions {
    fn from_parameters(parameters: &[Parameter]) -> Result<Self, ComputationError> {
        let mut options = TextOptions {
            scale: 1.0,
            case_insensitive: false,
            skip_blank: false,
        };

        for parameter in parameters {
            match parameter.acronym.as_str() {
                "SC" => {
                    let factor = match parameter.settings.get("factor") {
                        None => 2.0,
                        Some(value) => value.as_f64().ok_or_else(|| {
                            ComputationError::Malformed(format!(
                                "invalid scale factor `{value}`"
                            ))
                        })?,
                    };
                    options.scale *= factor;
                }
                "CI" => options.case_insensitive = true,
                "NB" => options.skip_blank = true,
                other => {
                    return Err(ComputationError::Malformed(format!(
                        "unknown parameter `{other}`"
                    )))
                }
            }
        }

        Ok(options)
    }
}

impl TextStatsProvider {
    pub fn new(stat: TextStat) -> Self {
        Self { stat }
    }

    fn lines(text: &str, options: &TextOptions) -> Attributes {
        let lines: Vec<_> = text
            .lines()
            .filter(|line| !options.skip_blank || !line.trim().is_empty())
            .collect();
        let longest = lines
            .iter()
            .map(|line| line.chars().count())
            .max()
            .unwrap_or_default();

        Attributes {
            rating: lines.len() as f64 * options.scale,
            values: BTreeMap::from([
                ("lines".to_owned(), lines.len() as f64),
                ("longest_line".to_owned(), longest as f64),
            ]),
        }
    }

    fn words(text: &str, options: &TextOptions) -> Attributes {
        let words: Vec<_> = text.split_whitespace().collect();
        let distinct: BTreeSet<_> = words
            .iter()
            .map(|word| match options.case_insensitive {
                true => word.to_lowercase(),
                false => (*word).to_owned(),
            })
            .collect();

        Attributes {
            rating: words.len() as f64 * options.scale,
            values: BTreeMap::from([
                ("words".to_owned(), words.len() as f64),
                ("distinct_words".to_owned(), distinct.len() as f64),
            ]),
        }
    }
}

impl ComputationProvider for TextStatsProvider {
    fn name(&self) -> &'static str {
        match self.stat {
            TextStat::Lines => "text_lines",
            TextStat::Words => "text_words",
        }
    }

    fn known_parameters(&self) -> &'static [&'static str] {
        &["SC", "CI", "NB"]
    }

    fn baseline(&self) -> Bytes {
        Bytes::from_static(b"Alpha beta\n\nalpha Gamma\n")
    }

    fn compute(
        &self,
        source: &[u8],
        parameters: &[Parameter],
    ) -> Result<Attributes, ComputationError> {
        let options = TextOptions::from_parameters(parameters)?;
        let text = std::str::from_utf8(source)
            .map_err(|e| ComputationError::Malformed(format!("source is not UTF-8: {e}")))?;

        Ok(match self.stat {
            TextStat::Lines => Self::lines(text, &options),
            TextStat::Words => Self::words(text, &options),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &[u8] = b"one Two\n\ntwo three\n";

    #[test]
    fn test_lines() {
        let provider = TextStatsProvider::new(TextStat::Lines);

        let plain = provider.compute(TEXT, &[]).unwrap();
        assert_eq!(plain.rating, 3.0);
        assert_eq!(plain.values["longest_line"], 9.0);

        let skip_blank = provider.compute(TEXT, &[Parameter::new("NB")]).unwrap();
        assert_eq!(skip_blank.rating, 2.0);
    }

    #[test]
    fn test_words() {
        let provider = TextStatsProvider::new(TextStat::Words);

        let plain = provider.compute(TEXT, &[]).unwrap();
        assert_eq!(plain.rating, 4.0);
        assert_eq!(plain.values["distinct_words"], 4.0);

        let folded = provider.compute(TEXT, &[Parameter::new("CI")]).unwrap();
        assert_eq!(folded.values["distinct_words"], 3.0);
    }

    #[test]
    fn test_scale() {
        let provider = TextStatsProvider::new(TextStat::Words);

        let doubled = provider.compute(TEXT, &[Parameter::new("SC")]).unwrap();
        assert_eq!(doubled.rating, 8.0);

        let scaled = provider
            .compute(
                TEXT,
                &[Parameter::new("SC").with_setting("factor", serde_json::json!(0.5))],
            )
            .unwrap();
        assert_eq!(scaled.rating, 2.0);

        let err = provider
            .compute(
                TEXT,
                &[Parameter::new("SC").with_setting("factor", serde_json::json!("lots"))],
            )
            .unwrap_err();
        assert!(matches!(err, ComputationError::Malformed(_)));
    }

    #[test]
    fn test_malformed_input() {
        let provider = TextStatsProvider::new(TextStat::Lines);

        let err = provider.compute(TEXT, &[Parameter::new("XX")]).unwrap_err();
        assert_eq!(
            err,
            ComputationError::Malformed("unknown parameter `XX`".into())
        );

        let err = provider.compute(&[0xff, 0xfe], &[]).unwrap_err();
        assert!(matches!(err, ComputationError::Malformed(_)));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = ProviderRegistry::builtin();

        assert_eq!(registry.get(DomainId(0)).unwrap().name(), "text_lines");
        assert_eq!(registry.get(DomainId(1)).unwrap().name(), "text_words");
        assert!(registry.get(DomainId(5)).is_none());
        assert_eq!(
            registry.domains().collect::<Vec<_>>(),
            [DomainId(0), DomainId(1)]
        );
    }
}
