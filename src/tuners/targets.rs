//! Target module selection

use crate::error::{PeftError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which modules an adapter is injected into
///
/// A single name or a list matches the full dotted path or its trailing
/// components (`"lin0"` matches `"encoder.lin0"`); a regex must match the
/// full path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    Exact(String),
    List(Vec<String>),
    Regex { regex: String },
}

impl TargetModules {
    pub fn regex(pattern: impl Into<String>) -> Self {
        TargetModules::Regex { regex: pattern.into() }
    }

    /// Union used for combined adapters
    pub fn union(&self, other: &TargetModules) -> TargetModules {
        match (self, other) {
            (TargetModules::Regex { regex: a }, TargetModules::Regex { regex: b }) if a == b => {
                self.clone()
            }
            (TargetModules::Regex { .. }, _) | (_, TargetModules::Regex { .. }) => {
                TargetModules::Regex {
                    regex: format!("(?:{})|(?:{})", self.as_regex(), other.as_regex()),
                }
            }
            _ => {
                let mut names = self.names().to_vec();
                for name in other.names() {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
                names.sort();
                TargetModules::List(names)
            }
        }
    }

    fn names(&self) -> &[String] {
        match self {
            TargetModules::Exact(name) => std::slice::from_ref(name),
            TargetModules::List(names) => names,
            TargetModules::Regex { .. } => &[],
        }
    }

    fn as_regex(&self) -> String {
        match self {
            TargetModules::Regex { regex } => regex.clone(),
            _ => {
                let alternatives: Vec<String> =
                    self.names().iter().map(|n| format!("(?:.*\\.)?{}", regex::escape(n))).collect();
                alternatives.join("|")
            }
        }
    }
}

impl From<&str> for TargetModules {
    fn from(name: &str) -> Self {
        TargetModules::Exact(name.to_string())
    }
}

impl From<Vec<&str>> for TargetModules {
    fn from(names: Vec<&str>) -> Self {
        TargetModules::List(names.into_iter().map(String::from).collect())
    }
}

impl From<Vec<String>> for TargetModules {
    fn from(names: Vec<String>) -> Self {
        TargetModules::List(names)
    }
}

impl fmt::Display for TargetModules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetModules::Exact(name) => write!(f, "{name}"),
            TargetModules::List(names) => write!(f, "[{}]", names.join(", ")),
            TargetModules::Regex { regex } => write!(f, "/{regex}/"),
        }
    }
}

/// Compiled form of [`TargetModules`]
#[derive(Debug)]
pub enum TargetMatcher {
    Names(Vec<String>),
    Regex(Regex),
}

impl TargetMatcher {
    pub fn new(targets: &TargetModules) -> Result<Self> {
        match targets {
            TargetModules::Regex { regex } => Regex::new(&format!("^(?:{regex})$"))
                .map(TargetMatcher::Regex)
                .map_err(|e| PeftError::InvalidConfig(format!("invalid target regex '{regex}': {e}"))),
            other => Ok(TargetMatcher::Names(other.names().to_vec())),
        }
    }

    pub fn is_match(&self, path: &str) -> bool {
        match self {
            TargetMatcher::Names(names) => names.iter().any(|name| path_matches(path, name)),
            TargetMatcher::Regex(re) => re.is_match(path),
        }
    }
}

/// `path` equals `name` or ends with `.name`
pub fn path_matches(path: &str, name: &str) -> bool {
    path == name || path.strip_suffix(name).is_some_and(|head| head.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_matches_suffix_components() {
        let m = TargetMatcher::new(&"lin0".into()).expect("matcher should compile");
        assert!(m.is_match("lin0"));
        assert!(m.is_match("encoder.lin0"));
        assert!(!m.is_match("xlin0"));
        assert!(!m.is_match("lin01"));
    }

    #[test]
    fn test_list_membership() {
        let m = TargetMatcher::new(&vec!["lin0", "conv1d"].into()).expect("matcher should compile");
        assert!(m.is_match("conv1d"));
        assert!(!m.is_match("lin1"));
    }

    #[test]
    fn test_regex_is_full_match() {
        let m = TargetMatcher::new(&TargetModules::regex("lin[0-9]")).expect("matcher should compile");
        assert!(m.is_match("lin1"));
        assert!(!m.is_match("encoder.lin1"));
        assert!(!m.is_match("lin12"));
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        let err = TargetMatcher::new(&TargetModules::regex("lin[")).unwrap_err();
        assert!(matches!(err, PeftError::InvalidConfig(_)));
    }

    #[test]
    fn test_union_of_lists_dedups() {
        let a: TargetModules = vec!["lin0"].into();
        let b: TargetModules = vec!["lin1", "lin0"].into();
        assert_eq!(a.union(&b), vec!["lin0", "lin1"].into());
    }

    #[test]
    fn test_union_with_regex_keeps_both() {
        let a = TargetModules::regex("lin0");
        let b: TargetModules = "emb".into();
        let m = TargetMatcher::new(&a.union(&b)).expect("matcher should compile");
        assert!(m.is_match("lin0"));
        assert!(m.is_match("emb"));
        assert!(m.is_match("encoder.emb"));
        assert!(!m.is_match("lin1"));
    }

    #[test]
    fn test_serde_shapes() {
        let exact: TargetModules = serde_json::from_str("\"lin0\"").expect("parse");
        let list: TargetModules = serde_json::from_str("[\"lin0\",\"lin1\"]").expect("parse");
        let regex: TargetModules = serde_json::from_str("{\"regex\":\"lin.*\"}").expect("parse");
        assert_eq!(exact, TargetModules::Exact("lin0".into()));
        assert_eq!(list, vec!["lin0", "lin1"].into());
        assert_eq!(regex, TargetModules::regex("lin.*"));
    }
}
