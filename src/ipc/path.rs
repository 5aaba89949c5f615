//! Immutable verb-path builder.

use std::fmt::{Display, Formatter};

/// Dot-separated verb path such as `session.channels`.
///
/// [`VerbPath::child`] returns a new value, so call sites that branch off a
/// shared base never see each other's segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VerbPath {
    path: String,
}

impl VerbPath {
    /// Root path made of the namespace label alone.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            path: namespace.into().trim_matches('.').to_owned(),
        }
    }

    /// Path extended by `segment`. Empty segments are ignored.
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        let segment = segment.trim_matches('.');
        if segment.is_empty() {
            return self.clone();
        }
        if self.path.is_empty() {
            return Self::new(segment);
        }
        Self {
            path: format!("{}.{segment}", self.path),
        }
    }

    /// Full dotted string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Individual segments, namespace first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('.').filter(|segment| !segment.is_empty())
    }
}

impl AsRef<str> for VerbPath {
    fn as_ref(&self) -> &str {
        &self.path
    }
}

impl Display for VerbPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}

impl From<VerbPath> for String {
    fn from(path: VerbPath) -> Self {
        path.path
    }
}
