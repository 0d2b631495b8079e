use std::fmt;
use std::sync::Arc;

/// Identifies one logical request by its arguments.
///
/// A [`CacheKey`] is derived deterministically from the request arguments by
/// [`CachedQuery::cache_id`](crate::CachedQuery::cache_id); uniqueness is the
/// collaborator's responsibility. It is the sole index into both the request
/// map and the probe map, and it is cheap to clone.
///
/// **NOTE**: Care must be taken to make sure the derivation is stable, as an
/// unstable key leads to bad cache reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&str> for CacheKey {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
