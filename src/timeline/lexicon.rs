// Category/label lexicon
//
// Per-language JSON documents map synonyms to a category and a canonical
// label. Each synonym is matched through a regex template; the longest
// matching synonym wins and ties keep declaration order.
// Built-in English and German documents are compiled in; a lexicon directory
// can override them.

use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::{FramewiseError, Result};

const BUILTIN_EN: &str = include_str!("../../resources/timeline_strings/en.json");
const BUILTIN_DE: &str = include_str!("../../resources/timeline_strings/de.json");

const KEY_PLACEHOLDER: &str = "${key}";

/// Languages with a lexicon name, and their file codes.
const LANGUAGE_CODES: [(&str, &str); 14] = [
    ("bulgarian", "bg"),
    ("catalan", "ca"),
    ("czech", "cs"),
    ("german", "de"),
    ("english", "en"),
    ("spanish", "es"),
    ("french", "fr"),
    ("hungarian", "hu"),
    ("italian", "it"),
    ("dutch", "nl"),
    ("polish", "pl"),
    ("portuguese", "pt"),
    ("slovak", "sk"),
    ("swedish", "sv"),
];

/// Map a language name ("German") or code ("de") to a lexicon file code.
/// Unknown languages map to "en".
pub fn language_code(language: &str) -> &'static str {
    let wanted = language.trim().to_lowercase();
    LANGUAGE_CODES
        .iter()
        .find(|(name, code)| *name == wanted || *code == wanted)
        .map(|(_, code)| *code)
        .unwrap_or("en")
}

#[derive(Debug, Deserialize)]
struct LexiconDocument {
    #[serde(default)]
    regex: Option<RegexTemplate>,
    categories: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegexTemplate {
    /// "`<pattern>`, '<flags>'"
    Inline(String),
    Object {
        pattern: String,
        #[serde(default)]
        flags: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct CategoryDef {
    #[serde(default)]
    labels: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
struct LexiconEntry {
    key: String,
    category: String,
    label: String,
    pattern: Regex,
}

#[derive(Debug, Clone)]
pub struct Lexicon {
    language: String,
    entries: Vec<LexiconEntry>,
}

impl Lexicon {
    /// Built-in lexicon for `language`, English when none is bundled.
    pub fn builtin(language: &str) -> Self {
        let (code, content) = match language_code(language) {
            "de" => ("de", BUILTIN_DE),
            _ => ("en", BUILTIN_EN),
        };

        match Self::from_json(code, content) {
            Ok(lexicon) => lexicon,
            Err(e) => {
                log::error!("Built-in {} lexicon is invalid: {}", code, e);
                Self {
                    language: code.to_string(),
                    entries: Vec::new(),
                }
            }
        }
    }

    /// Parse a lexicon document. Synonyms whose pattern does not compile are skipped.
    pub fn from_json(language: &str, content: &str) -> Result<Self> {
        let document: LexiconDocument = serde_json::from_str(content)
            .map_err(|e| FramewiseError::Config(format!("malformed {} lexicon: {}", language, e)))?;

        let (template, flags) = match &document.regex {
            Some(template) => parse_template(template),
            None => (None, "i".to_string()),
        };

        let mut entries = Vec::new();
        for (category, def) in document.categories {
            let def: CategoryDef = serde_json::from_value(def).unwrap_or_else(|e| {
                log::warn!("Ignoring malformed category {} in {} lexicon: {}", category, language, e);
                CategoryDef::default()
            });

            for (key, canonical) in def.labels {
                let label = match canonical.as_str() {
                    Some(s) if !s.trim().is_empty() => s.to_string(),
                    _ => key.clone(),
                };
                match compile(&key, template.as_deref(), &flags) {
                    Ok(pattern) => entries.push(LexiconEntry {
                        key,
                        category: category.clone(),
                        label,
                        pattern,
                    }),
                    Err(e) => log::warn!("Invalid pattern for {} in {} lexicon: {}", key, language, e),
                }
            }
        }

        Ok(Self {
            language: language.to_string(),
            entries,
        })
    }

    /// Load `<dir>/<code>.json`, falling back to the built-in documents when
    /// the file is missing or malformed.
    pub fn load(dir: Option<&Path>, language: &str) -> Self {
        let code = language_code(language);

        if let Some(path) = dir.map(|d| lexicon_path(d, code)) {
            if path.exists() {
                let parsed = std::fs::read_to_string(&path)
                    .map_err(FramewiseError::from)
                    .and_then(|content| Self::from_json(code, &content));
                match parsed {
                    Ok(lexicon) => {
                        log::debug!("Loaded {} lexicon from {}", code, path.display());
                        return lexicon;
                    }
                    Err(e) => log::warn!("{}: {}; using built-in lexicon", path.display(), e),
                }
            } else {
                log::debug!("No lexicon at {}; using built-in", path.display());
            }
        }

        Self::builtin(code)
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (category, label) of the longest synonym found in `text`, or empty strings.
    pub fn resolve(&self, text: &str) -> (String, String) {
        let mut best: Option<&LexiconEntry> = None;
        for entry in &self.entries {
            if !entry.pattern.is_match(text) {
                continue;
            }
            let longer = best.map_or(true, |b| entry.key.chars().count() > b.key.chars().count());
            if longer {
                best = Some(entry);
            }
        }

        best.map(|e| (e.category.clone(), e.label.clone()))
            .unwrap_or_default()
    }
}

fn lexicon_path(dir: &Path, code: &str) -> PathBuf {
    dir.join(format!("{}.json", code))
}

/// Split a template into (pattern, flags). An unusable template means the default.
fn parse_template(template: &RegexTemplate) -> (Option<String>, String) {
    match template {
        RegexTemplate::Object { pattern, flags } => (Some(pattern.clone()), flags.clone()),
        RegexTemplate::Inline(text) => {
            let inline = Regex::new(r"`([^`]*)`(?:\s*,\s*'([a-zA-Z]+)')?");
            match inline.ok().and_then(|re| re.captures(text).map(|c| {
                (
                    c.get(1).map(|m| m.as_str().to_string()),
                    c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
                )
            })) {
                Some(parsed) => parsed,
                None => {
                    log::debug!("Unrecognized regex template {:?}; using default", text);
                    (None, "i".to_string())
                }
            }
        }
    }
}

fn compile(key: &str, template: Option<&str>, flags: &str) -> std::result::Result<Regex, regex::Error> {
    let escaped = regex::escape(key);
    let pattern = match template {
        Some(t) => t.replace(KEY_PLACEHOLDER, &escaped),
        None => format!(r"\b{}s?\b", escaped),
    };
    let flags = flags.to_lowercase();

    RegexBuilder::new(&pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_english_resolves() {
        let lexicon = Lexicon::builtin("English");
        assert_eq!(lexicon.language(), "en");
        assert!(!lexicon.is_empty());

        assert_eq!(
            lexicon.resolve("A person walks up the driveway"),
            ("people".to_string(), "person".to_string())
        );
        assert_eq!(
            lexicon.resolve("Two CARS parked outside"),
            ("vehicles".to_string(), "car".to_string())
        );
        assert_eq!(lexicon.resolve("Nothing happening"), (String::new(), String::new()));
    }

    #[test]
    fn test_longest_key_wins() {
        let lexicon = Lexicon::builtin("en");
        assert_eq!(
            lexicon.resolve("Delivery person drops off a parcel"),
            ("people".to_string(), "courier".to_string())
        );
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let lexicon = Lexicon::from_json(
            "en",
            r#"{"categories": {
                "vehicles": {"labels": {"cart": "car"}},
                "animals": {"labels": {"calf": "cow"}}
            }}"#,
        )
        .unwrap();
        assert_eq!(
            lexicon.resolve("a calf next to a cart"),
            ("vehicles".to_string(), "car".to_string())
        );
    }

    #[test]
    fn test_object_template_and_german() {
        let lexicon = Lexicon::builtin("German");
        assert_eq!(lexicon.language(), "de");
        assert_eq!(
            lexicon.resolve("Zwei Hunde im Garten"),
            ("animals".to_string(), "dog".to_string())
        );
        assert_eq!(
            lexicon.resolve("Der Paketbote klingelt"),
            ("people".to_string(), "courier".to_string())
        );
    }

    #[test]
    fn test_empty_canonical_uses_key() {
        let lexicon = Lexicon::from_json(
            "en",
            r#"{"regex": "`\\b${key}\\b`, 'i'", "categories": {"misc": {"labels": {"drone": null}}}}"#,
        )
        .unwrap();
        assert_eq!(lexicon.resolve("DRONE overhead"), ("misc".to_string(), "drone".to_string()));
        // Template without the plural suffix
        assert_eq!(lexicon.resolve("drones overhead"), (String::new(), String::new()));
    }

    #[test]
    fn test_keys_are_escaped() {
        let lexicon = Lexicon::from_json(
            "en",
            r#"{"categories": {"misc": {"labels": {"c++": "code"}}}}"#,
        )
        .unwrap();
        assert_eq!(lexicon.len(), 1);
        assert_eq!(lexicon.resolve("cccc"), (String::new(), String::new()));
    }

    #[test]
    fn test_malformed_document_is_config_error() {
        assert!(matches!(
            Lexicon::from_json("en", "{ nope"),
            Err(FramewiseError::Config(_))
        ));
    }

    #[test]
    fn test_load_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("en.json"), "not json").unwrap();
        let lexicon = Lexicon::load(Some(dir.path()), "English");
        assert_eq!(lexicon.resolve("a dog"), ("animals".to_string(), "dog".to_string()));

        let missing = Lexicon::load(Some(&dir.path().join("absent")), "Swedish");
        assert_eq!(missing.language(), "en");
    }

    #[test]
    fn test_load_prefers_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sv.json"),
            r#"{"categories": {"animals": {"labels": {"hund": "dog"}}}}"#,
        )
        .unwrap();
        let lexicon = Lexicon::load(Some(dir.path()), "Swedish");
        assert_eq!(lexicon.language(), "sv");
        assert_eq!(lexicon.resolve("en hund"), ("animals".to_string(), "dog".to_string()));
    }

    #[test]
    fn test_language_code() {
        assert_eq!(language_code("German"), "de");
        assert_eq!(language_code("de"), "de");
        assert_eq!(language_code("Klingon"), "en");
    }
}
