use std::sync::Arc;

use crate::{ModuleKey, RemoteFile, SourceConfig};

/// Produces the ordered list of candidate files for a module.
///
/// Regular sources are always listed before try sources, each group in configuration order. The
/// order only depends on the configuration, so resolving the same key twice yields the same list.
#[derive(Debug, Clone, Default)]
pub struct SourceResolver {
    sources: Arc<[SourceConfig]>,
}

impl SourceResolver {
    pub fn new(sources: impl Into<Arc<[SourceConfig]>>) -> Self {
        Self {
            sources: sources.into(),
        }
    }

    /// Returns the candidate files for `key`.
    ///
    /// Try sources are only included if `include_try` is set, and come after all regular sources.
    pub fn resolve(&self, key: &ModuleKey, include_try: bool) -> Vec<RemoteFile> {
        let regular = self.sources.iter().filter(|source| !source.is_try());
        let try_sources = self
            .sources
            .iter()
            .filter(|source| include_try && source.is_try());

        let candidates: Vec<_> = regular
            .chain(try_sources)
            .map(|source| source.remote_file(key))
            .collect();

        tracing::trace!(
            module = %key,
            include_try,
            candidates = candidates.len(),
            "Resolved symbol sources"
        );
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<SourceConfig> {
        let yaml = r#"
- {id: try-first, type: http, url: "https://try1.example.com/", is_try: true}
- {id: regular-a, type: http, url: "https://a.example.com/"}
- {id: try-second, type: filesystem, path: /srv/try, is_try: true}
- {id: regular-b, type: filesystem, path: /srv/symbols}
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    fn ids(candidates: &[RemoteFile]) -> Vec<&str> {
        candidates.iter().map(|c| c.source_id().as_str()).collect()
    }

    #[test]
    fn test_regular_only() {
        let resolver = SourceResolver::new(sources());
        let key = ModuleKey::new("xul.pdb", "ABCD").unwrap();

        let candidates = resolver.resolve(&key, false);
        assert_eq!(ids(&candidates), ["regular-a", "regular-b"]);
        assert!(candidates.iter().all(|c| !c.is_try()));
    }

    #[test]
    fn test_try_after_regular() {
        let resolver = SourceResolver::new(sources());
        let key = ModuleKey::new("xul.pdb", "ABCD").unwrap();

        let candidates = resolver.resolve(&key, true);
        assert_eq!(
            ids(&candidates),
            ["regular-a", "regular-b", "try-first", "try-second"]
        );

        let uris: Vec<_> = candidates.iter().map(|c| c.uri()).collect();
        insta::assert_json_snapshot!(uris, @r###"
        [
          "https://a.example.com/xul.pdb/ABCD/xul.sym",
          "file:///srv/symbols/xul.pdb/ABCD/xul.sym",
          "https://try1.example.com/xul.pdb/ABCD/xul.sym",
          "file:///srv/try/xul.pdb/ABCD/xul.sym"
        ]
        "###);
    }

    #[test]
    fn test_deterministic() {
        let resolver = SourceResolver::new(sources());
        let key = ModuleKey::new("libxul.so", "0011").unwrap();

        let first: Vec<_> = resolver.resolve(&key, true).iter().map(|c| c.uri()).collect();
        let second: Vec<_> = resolver.resolve(&key, true).iter().map(|c| c.uri()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_sources() {
        let resolver = SourceResolver::default();
        let key = ModuleKey::new("xul.pdb", "ABCD").unwrap();
        assert!(resolver.resolve(&key, true).is_empty());
    }
}
