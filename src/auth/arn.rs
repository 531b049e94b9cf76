// src/auth/arn.rs

//! ARN patterns: `<namespace-glob>/<environment-glob>`
//!
//! `*` matches any run of name characters, never a `/`.

use crate::environment::spec::NAME_PUNCTUATION;
use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;

/// Characters allowed in namespace and environment names
pub const NAME_CHARS: &str = r"A-Za-z0-9\-+_@$&?^~.=";

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || NAME_PUNCTUATION.contains(c)
}

/// Regex source for a glob; `extra` is added to the wildcard's class
fn glob_regex(glob: &str, extra: &str) -> String {
    let mut out = String::new();
    for c in glob.chars() {
        if c == '*' {
            out.push_str(&format!("[{NAME_CHARS}{extra}]*"));
        } else {
            out.push_str(&regex::escape(&c.to_string()));
        }
    }
    out
}

/// Match a single name against a glob such as `team-*`
pub fn glob_matches(glob: &str, name: &str) -> bool {
    Regex::new(&format!("^{}$", glob_regex(glob, "")))
        .map(|regex| regex.is_match(name))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct ArnPattern {
    pub namespace: String,
    pub environment: String,
    regex: Regex,
}

impl PartialEq for ArnPattern {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.environment == other.environment
    }
}

impl Eq for ArnPattern {}

impl ArnPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let (namespace, environment) = pattern
            .split_once('/')
            .ok_or_else(|| Error::Validation(format!("invalid ARN {pattern}: expected <namespace>/<environment>")))?;
        for part in [namespace, environment] {
            if part.is_empty() || !part.chars().all(|c| c == '*' || is_name_char(c)) {
                return Err(Error::Validation(format!("invalid ARN {pattern}")));
            }
        }
        let source = format!(
            "^{}/{}$",
            glob_regex(namespace, ""),
            glob_regex(environment, "")
        );
        let regex = Regex::new(&source).map_err(|e| Error::Validation(format!("invalid ARN {pattern}: {e}")))?;
        Ok(Self {
            namespace: namespace.to_string(),
            environment: environment.to_string(),
            regex,
        })
    }

    /// Whether the pattern covers environment `environment` of `namespace`
    pub fn matches(&self, namespace: &str, environment: &str) -> bool {
        self.regex.is_match(&format!("{namespace}/{environment}"))
    }

    /// Whether the pattern covers the namespace as a whole
    ///
    /// Only patterns whose environment part is `*` speak for a namespace.
    pub fn matches_namespace(&self, namespace: &str) -> bool {
        self.environment == "*" && self.matches(namespace, "")
    }

    /// Whether everything `self` matches is also matched by `other`
    pub fn is_subset_of(&self, other: &ArnPattern) -> bool {
        let source = format!(
            "^{}/{}$",
            glob_regex(&other.namespace, r"\*"),
            glob_regex(&other.environment, r"\*")
        );
        match Regex::new(&source) {
            Ok(regex) => regex.is_match(&self.to_string()),
            Err(_) => false,
        }
    }

    /// (namespace, environment) globs for SQL filters
    pub fn globs(&self) -> (String, String) {
        (self.namespace.clone(), self.environment.clone())
    }
}

impl fmt::Display for ArnPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.environment)
    }
}
