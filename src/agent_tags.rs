//! Agent-selection tags.
//!
//! Buildkite expresses agent targeting as `key=value` strings. The controller
//! needs them in three shapes: parsed pairs for matching, Kubernetes labels on
//! the jobs it creates, and the comma-joined string handed to the in-pod agent.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

static LABEL_REGEX: OnceLock<Regex> = OnceLock::new();

const MAX_LABEL_LENGTH: usize = 63;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("could not parse tag: {0:?}")]
    Malformed(String),

    #[error("tag name {0:?} is not a valid label key")]
    InvalidLabelKey(String),

    #[error("tag value {0:?} is not a valid label value")]
    InvalidLabelValue(String),
}

/// A single `key=value` agent tag, order-significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTag {
    pub name: String,
    pub value: String,
}

/// Parse `key=value` rules into ordered tags. Any entry without `=` fails the
/// whole parse.
pub fn parse(rules: &[String]) -> Result<Vec<AgentTag>, TagError> {
    let mut tags = Vec::with_capacity(rules.len());
    for rule in rules {
        let (name, value) = rule
            .split_once('=')
            .ok_or_else(|| TagError::Malformed(rule.clone()))?;
        tags.push(AgentTag {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(tags)
}

/// Convert rules into Kubernetes label pairs. Tags that cannot become valid
/// labels are reported individually; the remaining tags are still emitted.
pub fn to_labels(rules: &[String]) -> (BTreeMap<String, String>, Vec<TagError>) {
    let mut labels = BTreeMap::new();
    let mut errors = Vec::new();
    for rule in rules {
        let Some((name, value)) = rule.split_once('=') else {
            errors.push(TagError::Malformed(rule.clone()));
            continue;
        };
        if !is_valid_label(name) {
            errors.push(TagError::InvalidLabelKey(name.to_string()));
            continue;
        }
        if !value.is_empty() && !is_valid_label(value) {
            errors.push(TagError::InvalidLabelValue(value.to_string()));
            continue;
        }
        labels.insert(name.to_string(), value.to_string());
    }
    (labels, errors)
}

/// Render tags as `k=v,k=v` preserving input order.
pub fn to_tag_string(tags: &[AgentTag]) -> String {
    tags.iter()
        .map(|t| format!("{}={}", t.name, t.value))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_valid_label(s: &str) -> bool {
    if s.len() > MAX_LABEL_LENGTH {
        return false;
    }
    let re = LABEL_REGEX.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9]([-_.a-zA-Z0-9]*[a-zA-Z0-9])?$").expect("label regex is valid")
    });
    re.is_match(s)
}
