//! Language registry — which file extensions belong to which language.
//!
//! The registry is a plain value owned by [`crate::App`]; nothing in the
//! crate reaches for a process-wide default.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{BazelleError, Result};

/// Languages known without any configuration.
const BUILTIN: &[(&str, &[&str])] = &[
    ("cc", &["c", "cc", "cpp", "cxx", "h", "hh", "hpp"]),
    ("go", &["go"]),
    ("java", &["java"]),
    ("javascript", &["js", "jsx", "mjs", "cjs"]),
    ("kotlin", &["kt", "kts"]),
    ("proto", &["proto"]),
    ("python", &["py", "pyi"]),
    ("rust", &["rs"]),
    ("typescript", &["ts", "tsx"]),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageRegistry {
    extensions: BTreeMap<String, BTreeSet<String>>,
}

impl LanguageRegistry {
    /// An empty registry. Mostly useful in tests.
    pub fn empty() -> Self {
        Self {
            extensions: BTreeMap::new(),
        }
    }

    /// The built-in language table.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (name, exts) in BUILTIN {
            registry.register(name, exts.iter().copied());
        }
        registry
    }

    /// Register a language, replacing any existing extension set for it.
    pub fn register<'a>(&mut self, name: &str, extensions: impl IntoIterator<Item = &'a str>) {
        let set = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self.extensions.insert(name.to_string(), set);
    }

    /// Apply `[languages]` overrides from the config file.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, Vec<String>>) -> Self {
        for (name, exts) in overrides {
            self.register(name, exts.iter().map(String::as_str));
        }
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.extensions.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    /// Union of the extension sets of `languages`. An empty selection means
    /// every registered language.
    pub fn extensions_for(&self, languages: &[String]) -> Result<BTreeSet<String>> {
        if languages.is_empty() {
            return Ok(self.extensions.values().flatten().cloned().collect());
        }

        let mut out = BTreeSet::new();
        for lang in languages {
            let exts = self
                .extensions
                .get(lang)
                .ok_or_else(|| BazelleError::UnknownLanguage(lang.clone()))?;
            out.extend(exts.iter().cloned());
        }
        Ok(out)
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_go_extensions() {
        let registry = LanguageRegistry::builtin();
        let exts = registry.extensions_for(&["go".to_string()]).unwrap();
        assert_eq!(exts.into_iter().collect::<Vec<_>>(), vec!["go"]);
    }

    #[test]
    fn test_empty_selection_means_all() {
        let registry = LanguageRegistry::builtin();
        let exts = registry.extensions_for(&[]).unwrap();
        assert!(exts.contains("go"));
        assert!(exts.contains("py"));
        assert!(exts.contains("proto"));
    }

    #[test]
    fn test_unknown_language_is_an_error() {
        let registry = LanguageRegistry::builtin();
        let err = registry.extensions_for(&["cobol".to_string()]).unwrap_err();
        assert!(matches!(err, BazelleError::UnknownLanguage(name) if name == "cobol"));
    }

    #[test]
    fn test_overrides_replace_and_add() {
        let mut overrides = BTreeMap::new();
        overrides.insert("go".to_string(), vec![".go".to_string(), "gotmpl".to_string()]);
        overrides.insert("starlark".to_string(), vec!["bzl".to_string()]);

        let registry = LanguageRegistry::builtin().with_overrides(&overrides);
        let go = registry.extensions_for(&["go".to_string()]).unwrap();
        assert!(go.contains("go"));
        assert!(go.contains("gotmpl"));
        assert!(registry.contains("starlark"));
    }
}
