use std::fmt;
use std::sync::Arc;

/// The normalized key under which a lookup is cached.
///
/// Semantically identical lookups always normalize to the same key, and the
/// key doubles as the file name (after [`fs_segment`](Self::fs_segment)) in
/// the on-disk tier, so it must stay stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    key: Arc<str>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

impl CacheKey {
    /// Returns the normalized key.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Whether any field contributed to this key.
    ///
    /// Normalizing a lookup whose fields are all absent produces an empty
    /// key; callers are expected to validate required fields upfront.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// Returns the key as a safe file name for the on-disk tier.
    pub fn fs_segment(&self) -> String {
        safe_path_segment(&self.key)
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKey {
            key: key.into().into(),
        }
    }
}

/// A builder for [`CacheKey`]s.
///
/// Fields are pushed in a fixed order per call site; absent optional fields
/// are omitted entirely rather than emitting placeholder tokens. A lookup
/// without a year thus keys differently from one with a year, by position.
/// **NOTE**: Care must be taken to keep the field order per call site
/// stable, as changing it silently orphans previously cached entries.
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    parts: Vec<String>,
}

impl CacheKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field to the key.
    pub fn field(&mut self, value: &str) -> &mut Self {
        self.parts.push(value.to_owned());
        self
    }

    /// Appends a field if it is present, and nothing otherwise.
    pub fn opt_field(&mut self, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.field(value);
        }
        self
    }

    /// Finalize the [`CacheKey`].
    ///
    /// Present fields are joined with `_`, lower-cased, and internal
    /// whitespace runs are collapsed to single underscores.
    pub fn build(self) -> CacheKey {
        let joined = self.parts.join("_").to_lowercase();

        let mut key = String::with_capacity(joined.len());
        let mut in_whitespace = false;
        for c in joined.chars() {
            if c.is_whitespace() {
                if !in_whitespace {
                    key.push('_');
                    in_whitespace = true;
                }
            } else {
                key.push(c);
                in_whitespace = false;
            }
        }

        CacheKey { key: key.into() }
    }
}

/// Protect against:
/// * ".."
/// * absolute paths
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder)
fn safe_path_segment(s: &str) -> String {
    s.replace(['.', '/', '\\', ':'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let mut builder = CacheKeyBuilder::new();
        builder
            .field("tech_specs")
            .field("Ford")
            .field("Focus")
            .field("2015")
            .opt_field(Some("petrol"));
        let key = builder.build();

        assert_eq!(key.as_str(), "tech_specs_ford_focus_2015_petrol");
    }

    #[test]
    fn test_whitespace_collapses() {
        let mut builder = CacheKeyBuilder::new();
        builder.field("tech_specs").field("Alfa  Romeo").field("159 Ti");
        let key = builder.build();

        assert_eq!(key.as_str(), "tech_specs_alfa_romeo_159_ti");
    }

    #[test]
    fn test_omitted_fields_alias_by_position() {
        let mut with_year = CacheKeyBuilder::new();
        with_year
            .field("vehicle")
            .field("Ford")
            .field("Focus")
            .opt_field(Some("2015"));

        let mut without_year = CacheKeyBuilder::new();
        without_year
            .field("vehicle")
            .field("Ford")
            .field("Focus")
            .opt_field(None);

        let with_year = with_year.build();
        let without_year = without_year.build();
        assert_ne!(with_year, without_year);
        assert_eq!(without_year.as_str(), "vehicle_ford_focus");
    }

    #[test]
    fn test_deterministic() {
        let build = || {
            let mut builder = CacheKeyBuilder::new();
            builder.field("vehicle").field("Ford").field("Focus");
            builder.build()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_empty_key() {
        let key = CacheKeyBuilder::new().build();
        assert!(key.is_empty());
    }

    #[test]
    fn test_fs_segment() {
        let key = CacheKey::for_testing("analysis_ab12:cde/..");
        assert_eq!(key.fs_segment(), "analysis_ab12_cde___");
    }
}
