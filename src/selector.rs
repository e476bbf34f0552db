//! Document selector matching.
//!
//! A selector is an ordered set of filters over `(language, scheme, glob)`.
//! Matching a document yields a score; any score above zero means the
//! selector applies. Filters with more specific matches score higher so that
//! callers comparing selectors prefer exact language matches over wildcard
//! or glob-only matches.

use globset::{Glob, GlobMatcher};
use lsp_types::{DocumentFilter, DocumentSelector, Url};

use crate::{Error, Result};

/// A compiled document selector ready for repeated matching.
#[derive(Debug)]
pub(crate) struct CompiledSelector {
    filters: Vec<CompiledFilter>,
}

#[derive(Debug)]
struct CompiledFilter {
    language: Option<String>,
    scheme: Option<String>,
    pattern: Option<GlobMatcher>,
}

impl CompiledSelector {
    /// Compiles the given selector, validating its glob patterns.
    pub fn new(selector: &DocumentSelector) -> Result<Self> {
        let filters = selector
            .iter()
            .map(CompiledFilter::new)
            .collect::<Result<Vec<_>>>()?;

        Ok(CompiledSelector { filters })
    }

    /// Scores the given document against this selector.
    ///
    /// The result is the highest score produced by any filter; `0` means the
    /// selector does not apply to the document.
    pub fn score(&self, uri: &Url, language: Option<&str>) -> u32 {
        self.filters
            .iter()
            .map(|filter| filter.score(uri, language))
            .max()
            .unwrap_or(0)
    }

    /// Returns `true` if any filter matches the given document.
    pub fn matches(&self, uri: &Url, language: Option<&str>) -> bool {
        self.score(uri, language) > 0
    }
}

impl CompiledFilter {
    fn new(filter: &DocumentFilter) -> Result<Self> {
        let pattern = match &filter.pattern {
            Some(pattern) => Some(
                Glob::new(pattern)
                    .map_err(|e| Error::Registration(format!("invalid glob {pattern:?}: {e}")))?
                    .compile_matcher(),
            ),
            None => None,
        };

        if filter.language.is_none() && filter.scheme.is_none() && pattern.is_none() {
            return Err(Error::Registration(
                "document filter must specify at least one of language, scheme, or pattern".into(),
            ));
        }

        Ok(CompiledFilter {
            language: filter.language.clone(),
            scheme: filter.scheme.clone(),
            pattern,
        })
    }

    fn score(&self, uri: &Url, language: Option<&str>) -> u32 {
        let mut score = 0;

        if let Some(expected) = &self.scheme {
            if expected == "*" {
                score += 3;
            } else if expected == uri.scheme() {
                score += 5;
            } else {
                return 0;
            }
        }

        if let Some(expected) = &self.language {
            match language {
                _ if expected == "*" => score += 5,
                Some(actual) if expected == actual => score += 10,
                _ => return 0,
            }
        }

        if let Some(matcher) = &self.pattern {
            if matcher.is_match(uri.path()) {
                score += 5;
            } else {
                return 0;
            }
        }

        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(language: Option<&str>, scheme: Option<&str>, pattern: Option<&str>) -> DocumentFilter {
        DocumentFilter {
            language: language.map(str::to_owned),
            scheme: scheme.map(str::to_owned),
            pattern: pattern.map(str::to_owned),
        }
    }

    fn uri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn matches_by_language() {
        let selector = CompiledSelector::new(&vec![filter(Some("rust"), None, None)]).unwrap();
        assert!(selector.matches(&uri("file:///src/main.rs"), Some("rust")));
        assert!(!selector.matches(&uri("file:///src/main.py"), Some("python")));
        assert!(!selector.matches(&uri("file:///src/main.rs"), None));
    }

    #[test]
    fn mismatched_scheme_scores_zero() {
        let selector =
            CompiledSelector::new(&vec![filter(Some("rust"), Some("file"), None)]).unwrap();
        assert!(selector.matches(&uri("file:///src/main.rs"), Some("rust")));
        assert!(!selector.matches(&uri("untitled:Untitled-1"), Some("rust")));
    }

    #[test]
    fn glob_pattern_constrains_paths() {
        let selector =
            CompiledSelector::new(&vec![filter(None, None, Some("**/*.toml"))]).unwrap();
        assert!(selector.matches(&uri("file:///project/Cargo.toml"), None));
        assert!(!selector.matches(&uri("file:///project/Cargo.lock"), None));
    }

    #[test]
    fn exact_language_outscores_wildcard() {
        let exact = CompiledSelector::new(&vec![filter(Some("rust"), None, None)]).unwrap();
        let wildcard = CompiledSelector::new(&vec![filter(Some("*"), None, None)]).unwrap();

        let doc = uri("file:///src/main.rs");
        assert!(exact.score(&doc, Some("rust")) > wildcard.score(&doc, Some("rust")));
    }

    #[test]
    fn first_of_multiple_filters_wins() {
        let selector = CompiledSelector::new(&vec![
            filter(Some("rust"), None, None),
            filter(Some("toml"), None, None),
        ])
        .unwrap();
        assert!(selector.matches(&uri("file:///Cargo.toml"), Some("toml")));
    }

    #[test]
    fn rejects_empty_filter() {
        assert!(CompiledSelector::new(&vec![filter(None, None, None)]).is_err());
    }

    #[test]
    fn rejects_invalid_glob() {
        assert!(CompiledSelector::new(&vec![filter(None, None, Some("a{b"))]).is_err());
    }
}
