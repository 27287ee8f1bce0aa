//! Argument normalization
//!
//! Maps the positional and keyword arguments of one call onto declared
//! parameter names. Parameter names cannot be recovered from a compiled
//! function, so every wrapped function declares its [`Signature`] at the
//! wrap site. Binding follows the usual rules for a dynamic call:
//!
//! - positionals fill positional parameters in order
//! - surplus positionals go into the variadic parameter as a tuple
//! - keywords bind by name, unknown keywords go into the keyword catch-all
//! - omitted parameters take their declared default
//!
//! When binding fails, [`normalize`] degrades to a positional zip and labels
//! whatever it cannot place (`*args[3]`, `**kwargs[x]`). Every supplied
//! argument lands in the output exactly once.

use serde::Serialize;
use thiserror::Error;

use crate::value::{ArgValue, CallArgs, NamedArgs};

/// How a parameter accepts its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Ordinary parameter, bindable by position or by name
    Positional,
    /// Collects surplus positionals (`*args`)
    VarPositional,
    /// Bindable by name only
    KeywordOnly,
    /// Collects unknown keywords (`**kwargs`)
    VarKeyword,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<ArgValue>,
}

/// Declared parameter list of one function
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Param>,
}

/// Why a call could not be bound to a signature
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindError {
    #[error("takes {expected} positional arguments but {given} were given")]
    TooManyPositional { expected: usize, given: usize },

    #[error("got an unexpected keyword argument '{0}'")]
    UnexpectedKeyword(String),

    #[error("got multiple values for argument '{0}'")]
    MultipleValues(String),

    #[error("missing required argument '{0}'")]
    MissingArgument(String),
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signature of plain positional parameters without defaults
    pub fn positional<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .fold(Self::new(), |sig, name| sig.param(name))
    }

    pub fn param(self, name: impl Into<String>) -> Self {
        self.push(name, ParamKind::Positional, None)
    }

    pub fn param_with_default(self, name: impl Into<String>, default: impl Serialize) -> Self {
        let default = ArgValue::capture(&default);
        self.push(name, ParamKind::Positional, Some(default))
    }

    pub fn var_args(self, name: impl Into<String>) -> Self {
        self.push(name, ParamKind::VarPositional, None)
    }

    pub fn keyword_only(self, name: impl Into<String>, default: Option<ArgValue>) -> Self {
        self.push(name, ParamKind::KeywordOnly, default)
    }

    pub fn var_kwargs(self, name: impl Into<String>) -> Self {
        self.push(name, ParamKind::VarKeyword, None)
    }

    fn push(mut self, name: impl Into<String>, kind: ParamKind, default: Option<ArgValue>) -> Self {
        self.params.push(Param {
            name: name.into(),
            kind,
            default,
        });
        self
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Names of parameters that accept a positional argument
    pub fn positional_names(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .filter(|p| p.kind == ParamKind::Positional)
            .map(|p| p.name.as_str())
    }

    /// Bind a call strictly, applying defaults
    pub fn bind(&self, args: &CallArgs) -> Result<NamedArgs, BindError> {
        let mut slots: Vec<Option<ArgValue>> = vec![None; self.params.len()];

        let positional_slots: Vec<usize> = self
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.kind == ParamKind::Positional)
            .map(|(i, _)| i)
            .collect();
        let var_positional = self
            .params
            .iter()
            .position(|p| p.kind == ParamKind::VarPositional);
        let var_keyword = self
            .params
            .iter()
            .position(|p| p.kind == ParamKind::VarKeyword);

        let mut surplus = Vec::new();
        for (i, value) in args.positional.iter().enumerate() {
            match positional_slots.get(i) {
                Some(&slot) => slots[slot] = Some(value.clone()),
                None => surplus.push(value.clone()),
            }
        }
        if !surplus.is_empty() {
            match var_positional {
                Some(slot) => slots[slot] = Some(ArgValue::Tuple(surplus)),
                None => {
                    return Err(BindError::TooManyPositional {
                        expected: positional_slots.len(),
                        given: args.positional.len(),
                    })
                }
            }
        }

        let mut extra_keywords = Vec::new();
        for (name, value) in &args.keyword {
            let target = self.params.iter().position(|p| {
                p.name == *name
                    && matches!(p.kind, ParamKind::Positional | ParamKind::KeywordOnly)
            });
            match target {
                Some(slot) if slots[slot].is_some() => {
                    return Err(BindError::MultipleValues(name.clone()))
                }
                Some(slot) => slots[slot] = Some(value.clone()),
                None if var_keyword.is_some() => {
                    extra_keywords.push((name.clone(), value.clone()));
                }
                None => return Err(BindError::UnexpectedKeyword(name.clone())),
            }
        }
        if let Some(slot) = var_keyword {
            slots[slot] = Some(ArgValue::Map(extra_keywords));
        }

        let mut bound = NamedArgs::new();
        for (param, slot) in self.params.iter().zip(slots) {
            let value = match (slot, param.kind) {
                (Some(v), _) => v,
                (None, ParamKind::VarPositional) => ArgValue::Tuple(Vec::new()),
                (None, ParamKind::VarKeyword) => ArgValue::Map(Vec::new()),
                (None, _) => match &param.default {
                    Some(default) => default.clone(),
                    None => return Err(BindError::MissingArgument(param.name.clone())),
                },
            };
            bound.insert(param.name.clone(), value);
        }
        Ok(bound)
    }
}

/// Label for a positional argument that has no parameter name
pub fn overflow_label(index: usize) -> String {
    format!("*args[{}]", index)
}

/// Label for a keyword whose name is already taken
pub fn keyword_overflow_label(name: &str) -> String {
    format!("**kwargs[{}]", name)
}

/// Normalize one call into an ordered name to value mapping.
///
/// Never fails. See the module docs for the degraded labelling.
pub fn normalize(signature: Option<&Signature>, args: &CallArgs) -> NamedArgs {
    let Some(signature) = signature else {
        return fallback(&[], args);
    };
    match signature.bind(args) {
        Ok(bound) => bound,
        Err(err) => {
            tracing::debug!("Signature binding failed ({}), using positional fallback", err);
            let names: Vec<&str> = signature.positional_names().collect();
            fallback(&names, args)
        }
    }
}

fn fallback(names: &[&str], args: &CallArgs) -> NamedArgs {
    let mut out = NamedArgs::new();
    for (i, value) in args.positional.iter().enumerate() {
        let key = match names.get(i) {
            Some(name) => (*name).to_string(),
            None => overflow_label(i),
        };
        out.insert(key, value.clone());
    }
    for (name, value) in &args.keyword {
        let key = if out.contains_key(name) {
            keyword_overflow_label(name)
        } else {
            name.clone()
        };
        out.insert(key, value.clone());
    }
    out
}

impl CallArgs {
    /// Rebuild raw call arguments from a normalized mapping.
    ///
    /// `*args[i]` labels become positionals in index order and
    /// `**kwargs[k]` labels become keyword `k`; every other entry is a
    /// keyword argument.
    pub fn from_named(named: &NamedArgs) -> Self {
        let mut positional: Vec<(usize, ArgValue)> = Vec::new();
        let mut keyword = Vec::new();
        for (name, value) in named.iter() {
            if let Some(index) = parse_label(name, "*args[") {
                if let Ok(index) = index.parse::<usize>() {
                    positional.push((index, value.clone()));
                    continue;
                }
            }
            let key = parse_label(name, "**kwargs[").unwrap_or(name);
            keyword.push((key.to_string(), value.clone()));
        }
        positional.sort_by_key(|(i, _)| *i);
        Self {
            positional: positional.into_iter().map(|(_, v)| v).collect(),
            keyword,
        }
    }
}

fn parse_label<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)?.strip_suffix(']')
}
