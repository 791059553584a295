//! Path mappings: how a route's path pattern matches a request path.
//!
//! Five kinds exist: exact, parameterized, prefix, regex, and
//! regex-with-prefix. The first three are trie-able: they reduce to a
//! skeleton (parameters collapsed to `:`) used by the trie router and by
//! duplicate detection.

use std::borrow::Cow;

use faststr::FastStr;
use percent_encoding::percent_decode_str;
use regex::Regex;

/// A path pattern failed to parse.
#[derive(Debug, thiserror::Error)]
pub enum PathMappingError {
    #[error("path `{0}` is not absolute")]
    NotAbsolute(FastStr),
    #[error("empty parameter name in `{0}`")]
    EmptyParamName(FastStr),
    #[error("bad regex: {0}")]
    BadRegex(#[from] regex::Error),
}

/// Decoded path parameters of one match, in capture order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMatch {
    params: Vec<(FastStr, FastStr)>,
}

impl PathMatch {
    fn push(&mut self, name: FastStr, value: FastStr) {
        self.params.push((name, value));
    }

    pub fn params(&self) -> &[(FastStr, FastStr)] {
        &self.params
    }

    pub fn into_params(self) -> Vec<(FastStr, FastStr)> {
        self.params
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(FastStr),
    Param(FastStr),
}

/// The kind tag of a mapping, used by duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathMappingKind {
    Exact,
    Parameterized,
    Prefix,
    Regex,
    RegexWithPrefix,
}

/// A route's path pattern.
#[derive(Debug, Clone)]
pub struct PathMapping {
    repr: Repr,
}

#[derive(Debug, Clone)]
enum Repr {
    /// Literal comparison.
    Exact(FastStr),
    /// Constant and `{name}`/`:name` segments; repeated names must
    /// back-reference the same captured value.
    Parameterized {
        pattern: FastStr,
        segments: Vec<Segment>,
        skeleton: FastStr,
        param_names: Vec<FastStr>,
    },
    /// Matches any path starting with the prefix.
    Prefix(FastStr),
    /// Arbitrary regex; not trie-able.
    Regex {
        regex: Regex,
        param_names: Vec<FastStr>,
    },
    /// The path must start with the prefix; the remainder (re-prefixed
    /// with `/`) is matched by the inner regex. The reported path is the
    /// full original.
    RegexWithPrefix {
        prefix: FastStr,
        regex: Regex,
        param_names: Vec<FastStr>,
    },
}

impl PathMapping {
    fn from_repr(repr: Repr) -> Self {
        Self { repr }
    }

    pub fn exact(path: impl Into<FastStr>) -> Result<Self, PathMappingError> {
        let path = absolute(path.into())?;
        Ok(Self::from_repr(Repr::Exact(path)))
    }

    pub fn parameterized(pattern: impl Into<FastStr>) -> Result<Self, PathMappingError> {
        let pattern = absolute(pattern.into())?;
        let mut segments = Vec::new();
        let mut param_names = Vec::new();
        let mut skeleton = String::new();
        for raw in pattern[1..].split('/') {
            skeleton.push('/');
            let segment = if let Some(name) = raw
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .or_else(|| raw.strip_prefix(':'))
            {
                if name.is_empty() {
                    return Err(PathMappingError::EmptyParamName(pattern.clone()));
                }
                let name = FastStr::new(name);
                if !param_names.contains(&name) {
                    param_names.push(name.clone());
                }
                skeleton.push(':');
                Segment::Param(name)
            } else {
                skeleton.push_str(raw);
                Segment::Literal(FastStr::new(raw))
            };
            segments.push(segment);
        }
        Ok(Self::from_repr(Repr::Parameterized {
            pattern,
            segments,
            skeleton: FastStr::from_string(skeleton),
            param_names,
        }))
    }

    pub fn prefix(prefix: impl Into<FastStr>) -> Result<Self, PathMappingError> {
        let mut prefix: String = absolute(prefix.into())?.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Ok(Self::from_repr(Repr::Prefix(FastStr::from_string(prefix))))
    }

    pub fn regex(pattern: &str) -> Result<Self, PathMappingError> {
        let regex = Regex::new(pattern)?;
        let param_names = capture_names(&regex);
        Ok(Self::from_repr(Repr::Regex { regex, param_names }))
    }

    pub fn regex_with_prefix(
        prefix: impl Into<FastStr>,
        pattern: &str,
    ) -> Result<Self, PathMappingError> {
        let mut prefix: String = absolute(prefix.into())?.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let regex = Regex::new(pattern)?;
        let param_names = capture_names(&regex);
        Ok(Self::from_repr(Repr::RegexWithPrefix {
            prefix: FastStr::from_string(prefix),
            regex,
            param_names,
        }))
    }

    pub fn kind(&self) -> PathMappingKind {
        match &self.repr {
            Repr::Exact(_) => PathMappingKind::Exact,
            Repr::Parameterized { .. } => PathMappingKind::Parameterized,
            Repr::Prefix(_) => PathMappingKind::Prefix,
            Repr::Regex { .. } => PathMappingKind::Regex,
            Repr::RegexWithPrefix { .. } => PathMappingKind::RegexWithPrefix,
        }
    }

    /// The parameter names this mapping captures.
    pub fn param_names(&self) -> &[FastStr] {
        match &self.repr {
            Repr::Exact(_) | Repr::Prefix(_) => &[],
            Repr::Parameterized { param_names, .. }
            | Repr::Regex { param_names, .. }
            | Repr::RegexWithPrefix { param_names, .. } => param_names,
        }
    }

    /// The parameter-erased canonical form, for trie-able kinds only.
    pub fn skeleton(&self) -> Option<FastStr> {
        match &self.repr {
            Repr::Exact(path) => Some(path.clone()),
            Repr::Parameterized { skeleton, .. } => Some(skeleton.clone()),
            Repr::Prefix(prefix) => Some(FastStr::from_string(format!("{prefix}*"))),
            Repr::Regex { .. } | Repr::RegexWithPrefix { .. } => None,
        }
    }

    pub fn is_trie_compatible(&self) -> bool {
        !matches!(self.repr, Repr::Regex { .. } | Repr::RegexWithPrefix { .. })
    }

    /// Applies the mapping. All mappings reject non-absolute paths.
    pub fn apply(&self, path: &str) -> Option<PathMatch> {
        if !path.starts_with('/') {
            return None;
        }
        match &self.repr {
            Repr::Exact(expected) => (path == expected.as_str()).then(PathMatch::default),
            Repr::Prefix(prefix) => {
                (path.starts_with(prefix.as_str()) || path == &prefix[..prefix.len() - 1])
                    .then(PathMatch::default)
            }
            Repr::Parameterized { segments, .. } => {
                let mut found = PathMatch::default();
                let mut parts = path[1..].split('/');
                for segment in segments {
                    let part = parts.next()?;
                    match segment {
                        Segment::Literal(expected) => {
                            if part != expected.as_str() {
                                return None;
                            }
                        }
                        Segment::Param(name) => {
                            let value = decode_utf8(part)?;
                            match found.get(name) {
                                // A repeated name must back-reference the
                                // same captured value.
                                Some(prev) => {
                                    if prev != value {
                                        return None;
                                    }
                                }
                                None => found.push(name.clone(), FastStr::new(value)),
                            }
                        }
                    }
                }
                if parts.next().is_some() {
                    return None;
                }
                Some(found)
            }
            Repr::Regex { regex, .. } => apply_regex(regex, path),
            Repr::RegexWithPrefix { prefix, regex, .. } => {
                let remainder = path.strip_prefix(&prefix[..prefix.len() - 1])?;
                let rebuilt = if remainder.starts_with('/') {
                    Cow::Borrowed(remainder)
                } else {
                    Cow::Owned(format!("/{remainder}"))
                };
                apply_regex(regex, &rebuilt)
            }
        }
    }
}

fn apply_regex(regex: &Regex, path: &str) -> Option<PathMatch> {
    let captures = regex.captures(path)?;
    let mut found = PathMatch::default();
    for name in regex.capture_names().flatten() {
        if let Some(value) = captures.name(name) {
            let value = decode_utf8(value.as_str())?;
            found.push(FastStr::new(name), FastStr::new(value));
        }
    }
    Some(found)
}

fn capture_names(regex: &Regex) -> Vec<FastStr> {
    regex.capture_names().flatten().map(FastStr::new).collect()
}

fn absolute(path: FastStr) -> Result<FastStr, PathMappingError> {
    if !path.starts_with('/') {
        return Err(PathMappingError::NotAbsolute(path));
    }
    Ok(path)
}

/// Percent-decodes one segment; rejects non-UTF-8 payloads.
fn decode_utf8(raw: &str) -> Option<String> {
    percent_decode_str(raw).decode_utf8().ok().map(Cow::into_owned)
}

#[cfg(test)]
mod matcher_tests {
    use super::{PathMapping, PathMappingError};

    #[test]
    fn exact_matching() {
        let mapping = PathMapping::exact("/users/list").unwrap();
        assert!(mapping.apply("/users/list").is_some());
        assert!(mapping.apply("/users/list/").is_none());
        assert!(mapping.apply("/users").is_none());
        assert!(mapping.apply("users/list").is_none());
        assert_eq!(mapping.skeleton().unwrap(), "/users/list");
    }

    #[test]
    fn parameterized_matching_and_skeleton() {
        let mapping = PathMapping::parameterized("/users/{id}/posts/:post").unwrap();
        assert_eq!(mapping.skeleton().unwrap(), "/users/:/posts/:");
        assert_eq!(
            mapping.param_names(),
            &[faststr::FastStr::from("id"), faststr::FastStr::from("post")],
        );

        let found = mapping.apply("/users/42/posts/7").unwrap();
        assert_eq!(found.get("id"), Some("42"));
        assert_eq!(found.get("post"), Some("7"));

        assert!(mapping.apply("/users/42/posts").is_none());
        assert!(mapping.apply("/users/42/posts/7/extra").is_none());

        // Captured params and declared names round-trip.
        let names: Vec<&str> = mapping.param_names().iter().map(|n| n.as_str()).collect();
        let captured: Vec<&str> = found.params().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, captured);
    }

    #[test]
    fn repeated_params_must_back_reference() {
        let mapping = PathMapping::parameterized("/pair/{v}/{v}").unwrap();
        let found = mapping.apply("/pair/x/x").unwrap();
        assert_eq!(found.get("v"), Some("x"));
        assert_eq!(found.params().len(), 1);
        assert!(mapping.apply("/pair/x/y").is_none());
    }

    #[test]
    fn params_are_percent_decoded_utf8() {
        let mapping = PathMapping::parameterized("/files/{name}").unwrap();
        let found = mapping.apply("/files/caf%C3%A9").unwrap();
        assert_eq!(found.get("name"), Some("café"));

        // Invalid UTF-8 after decoding rejects the path.
        assert!(mapping.apply("/files/%FF%FE").is_none());
    }

    #[test]
    fn prefix_matching() {
        let mapping = PathMapping::prefix("/static").unwrap();
        assert!(mapping.apply("/static/css/site.css").is_some());
        assert!(mapping.apply("/static/").is_some());
        assert!(mapping.apply("/static").is_some());
        assert!(mapping.apply("/statics").is_none());
        assert_eq!(mapping.skeleton().unwrap(), "/static/*");
    }

    #[test]
    fn regex_matching() {
        let mapping = PathMapping::regex(r"^/v(?P<version>\d+)/items$").unwrap();
        assert!(!mapping.is_trie_compatible());
        assert!(mapping.skeleton().is_none());
        let found = mapping.apply("/v2/items").unwrap();
        assert_eq!(found.get("version"), Some("2"));
        assert!(mapping.apply("/vx/items").is_none());
    }

    #[test]
    fn regex_with_prefix_matching() {
        let mapping =
            PathMapping::regex_with_prefix("/api", r"^/(?P<name>[a-z]+)$").unwrap();
        let found = mapping.apply("/api/users").unwrap();
        assert_eq!(found.get("name"), Some("users"));
        assert!(mapping.apply("/other/users").is_none());
        assert!(mapping.apply("/api/USERS").is_none());
    }

    #[test]
    fn non_absolute_patterns_are_rejected() {
        assert!(matches!(
            PathMapping::exact("users"),
            Err(PathMappingError::NotAbsolute(_)),
        ));
        assert!(matches!(
            PathMapping::parameterized("users/{id}"),
            Err(PathMappingError::NotAbsolute(_)),
        ));
        assert!(matches!(
            PathMapping::parameterized("/users/{}"),
            Err(PathMappingError::EmptyParamName(_)),
        ));
    }
}
