//! Pod label selector model
//!
//! One selector type backs all three lookup paths: a structured
//! `LabelSelector` read from a controller spec, a plain label map (the
//! ReplicationController and CronJob cases), and the selector *string*
//! returned by the scale subresource (`.status.selector`).

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::error::Error;

/// Operator of a set-based selector requirement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectorOperator {
    /// Label value must be in the specified set
    In,
    /// Label value must not be in the specified set (absent labels match)
    NotIn,
    /// Label must exist, value ignored
    Exists,
    /// Label must not exist
    DoesNotExist,
}

impl SelectorOperator {
    /// Check whether a label value satisfies this operator
    pub fn matches(&self, label_value: Option<&str>, values: &[String]) -> bool {
        match self {
            Self::In => label_value.is_some_and(|v| values.iter().any(|req| req == v)),
            Self::NotIn => {
                label_value.is_none() || !values.iter().any(|req| Some(req.as_str()) == label_value)
            }
            Self::Exists => label_value.is_some(),
            Self::DoesNotExist => label_value.is_none(),
        }
    }
}

/// A single selector requirement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectorRequirement {
    /// The label key the requirement applies to
    pub key: String,
    /// Relationship between the label value and `values`
    pub operator: SelectorOperator,
    /// Values for In/NotIn; empty for Exists/DoesNotExist
    pub values: Vec<String>,
}

impl SelectorRequirement {
    /// Check a label set against this requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key).map(|s| s.as_str());
        self.operator.matches(value, &self.values)
    }
}

/// Label selector resolving which pods an autoscaler controls
///
/// All requirements must hold for a pod to match. An empty selector matches
/// everything; callers reject empty selectors where that is an error (the
/// scale subresource path).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodSelector {
    /// Equality requirements (key must equal value)
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements
    pub requirements: Vec<SelectorRequirement>,
}

impl PodSelector {
    /// Build from a structured `LabelSelector` as found on controller specs
    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self, Error> {
        let match_labels = selector.match_labels.clone().unwrap_or_default();
        let mut requirements = Vec::new();
        for expr in selector.match_expressions.iter().flatten() {
            let operator = match expr.operator.as_str() {
                "In" => SelectorOperator::In,
                "NotIn" => SelectorOperator::NotIn,
                "Exists" => SelectorOperator::Exists,
                "DoesNotExist" => SelectorOperator::DoesNotExist,
                other => {
                    return Err(Error::configuration(format!(
                        "unknown selector operator {other:?} for key {}",
                        expr.key
                    )))
                }
            };
            let values = expr.values.clone().unwrap_or_default();
            match operator {
                SelectorOperator::In | SelectorOperator::NotIn if values.is_empty() => {
                    return Err(Error::configuration(format!(
                        "selector requirement on {} needs values",
                        expr.key
                    )))
                }
                _ => {}
            }
            requirements.push(SelectorRequirement {
                key: expr.key.clone(),
                operator,
                values,
            });
        }
        Ok(Self {
            match_labels,
            requirements,
        })
    }

    /// Build from a plain label map, treating every entry as an equality
    /// requirement (ReplicationController and CronJob expose label sets,
    /// not selectors)
    pub fn from_label_map(labels: &BTreeMap<String, String>) -> Self {
        Self {
            match_labels: labels.clone(),
            requirements: Vec::new(),
        }
    }

    /// Parse the selector string syntax returned by the scale subresource:
    /// `a=b`, `a==b`, `a!=b`, `a in (x,y)`, `a notin (x)`, `a`, `!a`,
    /// joined by commas.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut selector = PodSelector::default();
        for term in split_terms(input) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            selector.push_term(term)?;
        }
        Ok(selector)
    }

    fn push_term(&mut self, term: &str) -> Result<(), Error> {
        let bad = |term: &str| Error::configuration(format!("invalid selector term {term:?}"));

        if let Some(rest) = term.strip_prefix('!') {
            let key = rest.trim();
            if !valid_key(key) {
                return Err(bad(term));
            }
            self.requirements.push(SelectorRequirement {
                key: key.to_string(),
                operator: SelectorOperator::DoesNotExist,
                values: vec![],
            });
            return Ok(());
        }

        // Set-based forms: `key in (a,b)` / `key notin (a,b)`
        for (needle, operator) in [
            (" notin ", SelectorOperator::NotIn),
            (" in ", SelectorOperator::In),
        ] {
            if let Some(idx) = term.find(needle) {
                let key = term[..idx].trim();
                let rest = term[idx + needle.len()..].trim();
                let values = rest
                    .strip_prefix('(')
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(|| bad(term))?;
                let values: Vec<String> = values
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                if key.is_empty() || values.is_empty() {
                    return Err(bad(term));
                }
                self.requirements.push(SelectorRequirement {
                    key: key.to_string(),
                    operator,
                    values,
                });
                return Ok(());
            }
        }

        // Equality forms
        if let Some(idx) = term.find("!=") {
            let (key, value) = (term[..idx].trim(), term[idx + 2..].trim());
            if key.is_empty() {
                return Err(bad(term));
            }
            self.requirements.push(SelectorRequirement {
                key: key.to_string(),
                operator: SelectorOperator::NotIn,
                values: vec![value.to_string()],
            });
            return Ok(());
        }
        if let Some(idx) = term.find('=') {
            let key = term[..idx].trim();
            let value = term[idx..].trim_start_matches('=').trim();
            if key.is_empty() {
                return Err(bad(term));
            }
            self.match_labels
                .insert(key.to_string(), value.to_string());
            return Ok(());
        }

        // Bare key: existence
        if !valid_key(term) {
            return Err(bad(term));
        }
        self.requirements.push(SelectorRequirement {
            key: term.to_string(),
            operator: SelectorOperator::Exists,
            values: vec![],
        });
        Ok(())
    }

    /// Check whether a pod's labels satisfy every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
        self.requirements.iter().all(|req| req.matches(labels))
    }

    /// True when the selector has no requirements (matches everything)
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.requirements.is_empty()
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut terms: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for req in &self.requirements {
            terms.push(match req.operator {
                SelectorOperator::In => format!("{} in ({})", req.key, req.values.join(",")),
                SelectorOperator::NotIn => format!("{} notin ({})", req.key, req.values.join(",")),
                SelectorOperator::Exists => req.key.clone(),
                SelectorOperator::DoesNotExist => format!("!{}", req.key),
            });
        }
        write!(f, "{}", terms.join(","))
    }
}

/// Label keys are alphanumeric with `-`, `_`, `.` and a `/` prefix part
fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

/// Split a selector string on commas that are not inside parentheses
fn split_terms(input: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&input[start..]);
    terms
}
