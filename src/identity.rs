//! Function identities used as capture bucket keys

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Stable key for one logical function.
///
/// Built from the declaring module path and the qualified name. Each segment
/// becomes one directory level under the storage root, so nested functions
/// and closures get a distinct bucket. An `@` directory separates the module
/// from the qualified name, and segments are escaped rather than replaced,
/// so distinct identities never share a directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionIdentity {
    module: Vec<String>,
    qualname: Vec<String>,
}

impl FunctionIdentity {
    /// Build an identity from a module path (`a::b` or `a.b`) and a qualified
    /// name (`Type::method`, `outer.{{closure}}`)
    pub fn new(module_path: &str, qualified_name: &str) -> Self {
        Self {
            module: split_segments(module_path),
            qualname: split_segments(qualified_name),
        }
    }

    /// Identity for a nested function or closure declared inside this one
    pub fn child(&self, name: &str) -> Self {
        let mut qualname = self.qualname.clone();
        qualname.extend(split_segments(name));
        Self {
            module: self.module.clone(),
            qualname,
        }
    }

    pub(crate) fn from_segments(module: Vec<String>, qualname: Vec<String>) -> Self {
        Self { module, qualname }
    }

    /// Directory of this identity relative to a storage root
    pub fn relative_dir(&self) -> PathBuf {
        let mut dir: PathBuf = self.module.iter().map(|s| encode_segment(s)).collect();
        dir.push(QUALNAME_MARKER);
        dir.extend(self.qualname.iter().map(|s| encode_segment(s)));
        dir
    }

    /// Simple function name (last qualified segment)
    pub fn function_name(&self) -> &str {
        self.qualname
            .last()
            .or_else(|| self.module.last())
            .map_or("unknown", String::as_str)
    }

    /// Dotted module path
    pub fn module_name(&self) -> String {
        self.module.join(".")
    }

    /// Dotted qualified name without the module
    pub fn qualified_name(&self) -> String {
        self.qualname.join(".")
    }

    pub fn module_segments(&self) -> &[String] {
        &self.module
    }

    pub fn qualname_segments(&self) -> &[String] {
        &self.qualname
    }

    /// Rebuild an identity from a directory relative to a storage root.
    ///
    /// Directories without an `@` marker are read as a bare module path
    /// whose last segment is the function name.
    pub fn from_relative_dir(path: &Path) -> Option<Self> {
        let components: Vec<&str> = path
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        match components.iter().rposition(|c| *c == QUALNAME_MARKER) {
            Some(pos) => Some(Self {
                module: decode_all(&components[..pos])?,
                qualname: decode_all(&components[pos + 1..])?,
            }),
            None => {
                let mut module = decode_all(&components)?;
                let function = module.pop()?;
                Some(Self {
                    module,
                    qualname: vec![function],
                })
            }
        }
    }
}

impl fmt::Display for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let all: Vec<&str> = self
            .module
            .iter()
            .chain(self.qualname.iter())
            .map(String::as_str)
            .collect();
        write!(f, "{}", all.join("."))
    }
}

fn split_segments(path: &str) -> Vec<String> {
    path.split("::")
        .flat_map(|part| part.split('.'))
        .map(normalize_segment)
        .filter(|s| !s.is_empty())
        .collect()
}

fn normalize_segment(segment: &str) -> String {
    match segment.trim() {
        "{{closure}}" | "<lambda>" => "closure".to_string(),
        "<locals>" => String::new(),
        trimmed => trimmed.to_string(),
    }
}

/// Directory separating module segments from qualified-name segments
pub(crate) const QUALNAME_MARKER: &str = "@";

const ESCAPE: u8 = b'~';

/// Encode a name as a single path component.
///
/// ASCII alphanumerics, `_` and `-` are kept; every other byte becomes
/// `~XX`. The encoding is injective and never yields `.`, `..` or `@`.
pub(crate) fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push(char::from(ESCAPE));
            out.push_str(&format!("{:02X}", byte));
        }
    }
    out
}

/// Inverse of [`encode_segment`]
pub(crate) fn decode_segment(encoded: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut iter = encoded.bytes();
    while let Some(byte) = iter.next() {
        if byte == ESCAPE {
            let hex = [iter.next()?, iter.next()?];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(byte);
        }
    }
    String::from_utf8(bytes).ok()
}

fn decode_all(components: &[&str]) -> Option<Vec<String>> {
    components.iter().map(|c| decode_segment(c)).collect()
}

/// Identity of a function declared in the calling module
///
/// ```
/// let id = snapcall::function_identity!("checkout");
/// assert_eq!(id.function_name(), "checkout");
/// ```
#[macro_export]
macro_rules! function_identity {
    ($name:expr) => {
        $crate::identity::FunctionIdentity::new(module_path!(), $name)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_splits_rust_and_dotted_paths() {
        let id = FunctionIdentity::new("app::billing", "Invoice::total");
        assert_eq!(id.module_name(), "app.billing");
        assert_eq!(id.qualified_name(), "Invoice.total");
        assert_eq!(id.function_name(), "total");
        assert_eq!(id.to_string(), "app.billing.Invoice.total");
        assert_eq!(id.relative_dir(), Path::new("app/billing/@/Invoice/total"));
    }

    #[test]
    fn test_closures_get_distinct_identity() {
        let outer = FunctionIdentity::new("app", "run");
        let inner = FunctionIdentity::new("app", "run::{{closure}}");
        assert_ne!(outer, inner);
        assert_eq!(inner.function_name(), "closure");
        assert_eq!(outer.child("{{closure}}"), inner);
    }

    #[test]
    fn test_unsafe_characters_are_escaped() {
        let id = FunctionIdentity::new("my mod", "f<T>");
        assert_eq!(id.module_name(), "my mod");
        assert_eq!(id.function_name(), "f<T>");
        assert_eq!(id.relative_dir(), Path::new("my~20mod/@/f~3CT~3E"));

        let escape = FunctionIdentity::new("m", "../etc");
        assert_eq!(escape.function_name(), "/etc");
        assert_eq!(escape.relative_dir(), Path::new("m/@/~2Fetc"));
        for component in escape.relative_dir().components() {
            assert!(matches!(component, std::path::Component::Normal(_)));
        }
    }

    #[test]
    fn test_module_boundary_keeps_dirs_apart() {
        let a = FunctionIdentity::new("a::b", "c");
        let b = FunctionIdentity::new("a", "b::c");
        assert_ne!(a.relative_dir(), b.relative_dir());

        let sanitized = FunctionIdentity::new("m", "f_T_");
        let generic = FunctionIdentity::new("m", "f<T>");
        assert_ne!(sanitized.relative_dir(), generic.relative_dir());
    }

    #[test]
    fn test_python_locals_marker_is_dropped() {
        let id = FunctionIdentity::new("tests", "outer.<locals>.inner");
        assert_eq!(id.qualified_name(), "outer.inner");
    }

    #[test]
    fn test_from_relative_dir() {
        let id = FunctionIdentity::new("a::b", "T::f<U>");
        assert_eq!(FunctionIdentity::from_relative_dir(&id.relative_dir()), Some(id));

        let legacy = FunctionIdentity::from_relative_dir(Path::new("a/b/f")).unwrap();
        assert_eq!(legacy.function_name(), "f");
        assert_eq!(legacy.module_name(), "a.b");
        assert!(FunctionIdentity::from_relative_dir(Path::new("")).is_none());
        assert!(FunctionIdentity::from_relative_dir(Path::new("m/@/bad~Z")).is_none());
    }

    #[test]
    fn test_macro_uses_module_path() {
        let id = crate::function_identity!("probe");
        assert_eq!(id.module_name(), "snapcall.identity.tests");
    }
}
