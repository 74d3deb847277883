//! Relabel rules over external label sets.
//!
//! A minimal keep/drop/replace ruleset in the style of the wider monitoring
//! ecosystem: each rule concatenates selected source label values, matches
//! an anchored regular expression, and either gates the whole label set or
//! rewrites a target label. Rulesets deserialize from configuration via
//! `serde`.

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;

/// What a rule does when its regex is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelabelAction {
    /// Drop the whole label set unless the regex matches.
    #[default]
    Keep,
    /// Drop the whole label set if the regex matches.
    Drop,
    /// Rewrite `target_label` with the expanded replacement on match.
    Replace,
}

/// An anchored regular expression.
///
/// Patterns are wrapped in `^(?:...)$` so a rule always matches the whole
/// concatenated value, never a substring.
#[derive(Debug, Clone)]
pub struct Pattern {
    regex: Regex,
}

impl Pattern {
    /// Compiles an anchored pattern.
    ///
    /// # Errors
    ///
    /// Returns the underlying regex error for invalid patterns.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(&format!("^(?:{pattern})$"))?,
        })
    }

    fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    fn captures<'v>(&self, value: &'v str) -> Option<regex::Captures<'v>> {
        self.regex.captures(value)
    }
}

impl Default for Pattern {
    fn default() -> Self {
        Self::new("(.*)").expect("default pattern is valid")
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let pattern = String::deserialize(deserializer)?;
        Pattern::new(&pattern).map_err(serde::de::Error::custom)
    }
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_replacement() -> String {
    "$1".to_string()
}

/// A single relabel rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RelabelRule {
    /// Labels whose values are concatenated into the matched value.
    /// Missing labels contribute an empty string.
    #[serde(default)]
    pub source_labels: Vec<String>,
    /// Separator placed between concatenated source values.
    #[serde(default = "default_separator")]
    pub separator: String,
    /// The anchored expression matched against the concatenated value.
    #[serde(default)]
    pub regex: Pattern,
    /// Label written by `replace`.
    #[serde(default)]
    pub target_label: String,
    /// Replacement template for `replace`; capture groups expand.
    #[serde(default = "default_replacement")]
    pub replacement: String,
    /// What to do on match.
    #[serde(default)]
    pub action: RelabelAction,
}

impl Default for RelabelRule {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: default_separator(),
            regex: Pattern::default(),
            target_label: String::new(),
            replacement: default_replacement(),
            action: RelabelAction::Keep,
        }
    }
}

/// Runs `rules` over `labels` in order.
///
/// Returns `None` when a keep/drop rule rejects the set, otherwise the
/// (possibly rewritten) label set. An empty expanded replacement removes
/// the target label.
#[must_use]
pub fn process(
    labels: &BTreeMap<String, String>,
    rules: &[RelabelRule],
) -> Option<BTreeMap<String, String>> {
    let mut labels = labels.clone();

    for rule in rules {
        let value = rule
            .source_labels
            .iter()
            .map(|name| labels.get(name).map_or("", String::as_str))
            .collect::<Vec<_>>()
            .join(&rule.separator);

        match rule.action {
            RelabelAction::Keep => {
                if !rule.regex.is_match(&value) {
                    return None;
                }
            }
            RelabelAction::Drop => {
                if rule.regex.is_match(&value) {
                    return None;
                }
            }
            RelabelAction::Replace => {
                if let Some(caps) = rule.regex.captures(&value) {
                    let mut expanded = String::new();
                    caps.expand(&rule.replacement, &mut expanded);
                    if expanded.is_empty() {
                        labels.remove(&rule.target_label);
                    } else if !rule.target_label.is_empty() {
                        labels.insert(rule.target_label.clone(), expanded);
                    }
                }
            }
        }
    }

    Some(labels)
}
