//! Sensitive-data filtering for captured arguments
//!
//! Supports:
//! - Name patterns with `*` wildcards: `api_*`, `*_token`
//! - A built-in vocabulary of sensitive key fragments for nested mappings
//! - A long-string heuristic for values that embed credentials
//! - Minimal mode, which records only type names

use regex::Regex;

use crate::config::CaptureConfig;
use crate::value::{ArgValue, CallArgs, NamedArgs};

/// Placeholder for string values that look like they carry secrets
pub const SENSITIVE_STRING_PLACEHOLDER: &str = "<FILTERED:SENSITIVE_STRING>";

/// Strings at or below this length are never treated as sensitive content
const SENSITIVE_STRING_MIN_LEN: usize = 10;

const SENSITIVE_VOCABULARY: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "token",
    "access_token",
    "refresh_token",
    "auth_token",
    "secret",
    "api_secret",
    "client_secret",
    "key",
    "api_key",
    "private_key",
    "public_key",
    "auth",
    "authorization",
    "credential",
    "creds",
    "session",
    "sessionid",
    "cookie",
    "cookies",
    "hash",
    "salt",
    "pin",
    "otp",
    "signature",
    "sign",
];

/// A compiled wildcard pattern for module, function, and argument names
#[derive(Debug, Clone)]
pub struct NamePattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    /// Case-insensitive substring, used when the regex cannot be built
    Substring(String),
}

impl NamePattern {
    /// Compile a pattern where `*` matches any run of characters.
    ///
    /// Matching is anchored and case-insensitive.
    pub fn compile(pattern: &str) -> Self {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let matcher = match Regex::new(&format!("(?i)^{}$", body)) {
            Ok(re) => Matcher::Regex(re),
            Err(err) => {
                tracing::warn!(
                    "Invalid name pattern '{}' ({}), using substring match",
                    pattern,
                    err
                );
                Matcher::Substring(pattern.to_lowercase())
            }
        };
        Self {
            source: pattern.to_string(),
            matcher,
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Regex(re) => re.is_match(text),
            Matcher::Substring(needle) => text.to_lowercase().contains(needle.as_str()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Compile a list of patterns, skipping blanks
pub fn compile_patterns(patterns: &[String]) -> Vec<NamePattern> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(NamePattern::compile)
        .collect()
}

/// Placeholder that replaces a sensitive value stored under `key`
pub fn placeholder(key: &str) -> String {
    format!("<FILTERED:{}>", key.to_uppercase())
}

/// Whether a string is a placeholder produced by capture
pub fn is_placeholder(text: &str) -> bool {
    (text.starts_with("<FILTERED:") || text.starts_with("<UNSERIALIZABLE:"))
        && text.ends_with('>')
}

/// Filter that removes sensitive values from captured arguments
#[derive(Debug, Clone)]
pub struct SensitivityFilter {
    ignore_args: Vec<NamePattern>,
    /// Lowercase fragments matched as substrings
    sensitive_keys: Vec<String>,
    minimal: bool,
}

impl SensitivityFilter {
    pub fn new(config: &CaptureConfig) -> Self {
        let mut sensitive_keys: Vec<String> =
            SENSITIVE_VOCABULARY.iter().map(|s| s.to_string()).collect();
        for pattern in &config.ignore_args {
            let clean = pattern.replace('*', "").to_lowercase();
            if !clean.is_empty() && !sensitive_keys.contains(&clean) {
                sensitive_keys.push(clean);
            }
        }
        Self {
            ignore_args: compile_patterns(&config.ignore_args),
            sensitive_keys,
            minimal: config.effective_minimal(),
        }
    }

    /// Override minimal mode independently of the config
    pub fn with_minimal(mut self, minimal: bool) -> Self {
        self.minimal = minimal;
        self
    }

    pub fn is_minimal(&self) -> bool {
        self.minimal
    }

    /// Whether an argument name matches a configured ignore pattern
    pub fn is_arg_ignored(&self, name: &str) -> bool {
        self.ignore_args.iter().any(|p| p.matches(name))
    }

    /// Whether a nested key is sensitive (configured pattern or vocabulary)
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        if self.is_arg_ignored(key) {
            return true;
        }
        let lower = key.to_lowercase();
        self.sensitive_keys.iter().any(|k| lower.contains(k.as_str()))
    }

    /// Filter a normalized argument mapping.
    ///
    /// In minimal mode every value becomes its type name, except ignored
    /// arguments which still get the placeholder.
    pub fn filter_named(&self, args: &NamedArgs) -> NamedArgs {
        if self.minimal {
            return self.minimal_args(args);
        }
        args.iter()
            .map(|(name, value)| {
                let filtered = if self.is_arg_ignored(name) {
                    ArgValue::Str(placeholder(name))
                } else {
                    self.filter_value(value)
                };
                (name, filtered)
            })
            .collect()
    }

    /// Type-name-only view of an argument mapping
    pub fn minimal_args(&self, args: &NamedArgs) -> NamedArgs {
        args.iter()
            .map(|(name, value)| {
                let shape = if self.is_arg_ignored(name) {
                    placeholder(name)
                } else {
                    value.type_name().to_string()
                };
                (name, ArgValue::Str(shape))
            })
            .collect()
    }

    /// Filter raw positional and keyword arguments
    pub fn filter_call(&self, args: &CallArgs) -> CallArgs {
        if self.minimal {
            return CallArgs {
                positional: args
                    .positional
                    .iter()
                    .map(|v| ArgValue::Str(v.type_name().to_string()))
                    .collect(),
                keyword: args
                    .keyword
                    .iter()
                    .filter(|(k, _)| !self.is_arg_ignored(k))
                    .map(|(k, v)| (k.clone(), ArgValue::Str(v.type_name().to_string())))
                    .collect(),
            };
        }
        CallArgs {
            positional: args.positional.iter().map(|v| self.filter_value(v)).collect(),
            keyword: args
                .keyword
                .iter()
                .map(|(k, v)| {
                    let filtered = if self.is_sensitive_key(k) {
                        ArgValue::Str(placeholder(k))
                    } else {
                        self.filter_value(v)
                    };
                    (k.clone(), filtered)
                })
                .collect(),
        }
    }

    /// Recursively filter one value
    pub fn filter_value(&self, value: &ArgValue) -> ArgValue {
        match value {
            ArgValue::Str(s) => self.filter_string(s),
            ArgValue::Map(entries) => ArgValue::Map(self.filter_entries(entries)),
            ArgValue::Record { type_name, fields } => ArgValue::Record {
                type_name: type_name.clone(),
                fields: self.filter_entries(fields),
            },
            ArgValue::List(items) => ArgValue::List(self.filter_items(items)),
            ArgValue::Tuple(items) => ArgValue::Tuple(self.filter_items(items)),
            ArgValue::Set(items) => ArgValue::Set(self.filter_items(items)),
            ArgValue::Variant {
                type_name,
                variant,
                payload,
            } => ArgValue::Variant {
                type_name: type_name.clone(),
                variant: variant.clone(),
                payload: payload.as_ref().map(|p| Box::new(self.filter_value(p))),
            },
            other => other.clone(),
        }
    }

    fn filter_entries(&self, entries: &[(String, ArgValue)]) -> Vec<(String, ArgValue)> {
        entries
            .iter()
            .map(|(k, v)| {
                let filtered = if self.is_sensitive_key(k) {
                    ArgValue::Str(placeholder(k))
                } else {
                    self.filter_value(v)
                };
                (k.clone(), filtered)
            })
            .collect()
    }

    fn filter_items(&self, items: &[ArgValue]) -> Vec<ArgValue> {
        items.iter().map(|v| self.filter_value(v)).collect()
    }

    fn filter_string(&self, s: &str) -> ArgValue {
        if is_placeholder(s) || s.chars().count() <= SENSITIVE_STRING_MIN_LEN {
            return ArgValue::Str(s.to_string());
        }
        let lower = s.to_lowercase();
        if self.sensitive_keys.iter().any(|k| lower.contains(k.as_str())) {
            ArgValue::Str(SENSITIVE_STRING_PLACEHOLDER.to_string())
        } else {
            ArgValue::Str(s.to_string())
        }
    }
}
