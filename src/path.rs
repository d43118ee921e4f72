use std::fmt;

use unicode_normalization::UnicodeNormalization;

use crate::error::{RqError, RqResult};

/// An absolute, POSIX-style, case-sensitive path (spec §3).
///
/// Construction normalizes to NFKC at the RQTree/remote boundary unless
/// the owning tree is configured with `no_unicode_normalize`. `RqPath`
/// itself stores whatever string it was built with; callers choose
/// whether to normalize via [`RqPath::new`] vs [`RqPath::new_raw`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RqPath(String);

impl RqPath {
    /// Build a path, applying NFKC normalization to each component.
    pub fn new(raw: impl AsRef<str>) -> RqResult<Self> {
        Self::build(raw.as_ref(), true)
    }

    /// Build a path without normalization (the `no_unicode_normalize` mode).
    pub fn new_raw(raw: impl AsRef<str>) -> RqResult<Self> {
        Self::build(raw.as_ref(), false)
    }

    fn build(raw: &str, normalize: bool) -> RqResult<Self> {
        if !raw.starts_with('/') {
            return Err(RqError::invalid_name(raw.to_string()));
        }
        let rendered = if normalize {
            raw.nfkc().collect::<String>()
        } else {
            raw.to_string()
        };
        if rendered.len() > 1 && rendered.ends_with('/') {
            return Err(RqError::invalid_name(rendered));
        }
        Ok(Self(rendered))
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The final path component, e.g. `name` for `/a/b/name`.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// The parent path, e.g. `/a/b` for `/a/b/name`, or `/` at the root.
    pub fn parent(&self) -> Self {
        if self.is_root() {
            return self.clone();
        }
        match self.0.rfind('/') {
            Some(0) => Self("/".to_string()),
            Some(idx) => Self(self.0[..idx].to_string()),
            None => Self("/".to_string()),
        }
    }

    pub fn join(&self, name: &str) -> RqResult<Self> {
        if name.contains('/') {
            return Err(RqError::invalid_name(name.to_string()));
        }
        let joined = if self.is_root() {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.0)
        };
        Self::new_raw(joined)
    }

    /// Whether `self` is `other` or a descendant of `other` (used by
    /// `updatePath`/`removePath` prefix matching in §4.1).
    pub fn is_under(&self, other: &RqPath) -> bool {
        if self.0 == other.0 {
            return true;
        }
        if other.is_root() {
            return self.0.starts_with('/');
        }
        self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/')
    }

    /// Rewrite the `old_prefix` portion of this path to `new_prefix`,
    /// for queue path renames. Panics if `self` is not under `old_prefix`.
    pub fn rebase(&self, old_prefix: &RqPath, new_prefix: &RqPath) -> Self {
        debug_assert!(self.is_under(old_prefix));
        if self.0 == old_prefix.0 {
            return new_prefix.clone();
        }
        let suffix = &self.0[old_prefix.0.len()..];
        Self(format!("{}{}", new_prefix.0, suffix))
    }
}

impl fmt::Display for RqPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Default temp-name predicate: basename starts with `.` (spec §6).
///
/// `path`'s configured tree may substitute a different predicate; this
/// is the default used when none is configured.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.')
}
