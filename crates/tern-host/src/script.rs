//! Scripts and the script registry.
//!
//! A [`Script`] is immutable once registered. Identity is two-level: the
//! synthetic path (URL) names where the engine says the code lives, while the
//! MD5 contents hash decides whether two VM classes are really the same
//! script. Nashorn recompiles a script function once argument types are
//! known, producing a fresh class with identical source; the registry aliases
//! such recompilations to the original script instead of inventing a new one.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use md5::{Digest, Md5};

use crate::url::ScriptUrl;

#[derive(Debug)]
pub struct Script {
    id: String,
    url: ScriptUrl,
    source: String,
    contents_hash: OnceLock<String>,
    line_offsets: Vec<usize>,
    source_map_url: Option<String>,
    source_url: Option<String>,
}

impl Script {
    fn new(id: String, url: ScriptUrl, source: String) -> Self {
        let line_offsets = line_offsets(&source);
        let source_map_url = parse_annotation(&source, "sourceMappingURL");
        let source_url = parse_annotation(&source, "sourceURL");
        Self {
            id,
            url,
            source,
            contents_hash: OnceLock::new(),
            line_offsets,
            source_map_url,
            source_url,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &ScriptUrl {
        &self.url
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Lowercase-hex MD5 of the source bytes, computed on first use.
    pub fn contents_hash(&self) -> &str {
        self.contents_hash.get_or_init(|| {
            let mut hasher = Md5::new();
            hasher.update(self.source.as_bytes());
            hex::encode(hasher.finalize())
        })
    }

    pub fn line_count(&self) -> usize {
        self.line_offsets.len()
    }

    /// The 1-based line's text, without its terminator.
    pub fn line(&self, line_1_based: usize) -> Option<&str> {
        let start = *self.line_offsets.get(line_1_based.checked_sub(1)?)?;
        let rest = &self.source[start..];
        Some(rest.split(['\n', '\r']).next().unwrap_or(rest))
    }

    pub fn source_map_url(&self) -> Option<&str> {
        self.source_map_url.as_deref()
    }

    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }
}

fn line_offsets(source: &str) -> Vec<usize> {
    let mut offsets = vec![0];
    for (idx, byte) in source.bytes().enumerate() {
        if byte == b'\n' {
            offsets.push(idx + 1);
        }
    }
    offsets
}

/// Parse a `//# name=value` (or legacy `//@ name=value`) annotation comment.
fn parse_annotation(source: &str, name: &str) -> Option<String> {
    for line in source.lines() {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed
            .strip_prefix("//#")
            .or_else(|| trimmed.strip_prefix("//@"))
            .map(str::trim_start)
        else {
            continue;
        };
        if let Some(value) = rest.strip_prefix(name) {
            let value = value.trim_start();
            if let Some(value) = value.strip_prefix('=') {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

#[derive(Debug)]
pub enum RegisterOutcome {
    /// A new script was created for a new URL.
    Added(Arc<Script>),
    /// Contents matched an existing script; the new URL now aliases it.
    Aliased(Arc<Script>),
    /// URL and contents were both already known.
    Existing(Arc<Script>),
}

impl RegisterOutcome {
    pub fn script(&self) -> &Arc<Script> {
        match self {
            RegisterOutcome::Added(s) | RegisterOutcome::Aliased(s) | RegisterOutcome::Existing(s) => s,
        }
    }

    pub fn is_new_url(&self) -> bool {
        matches!(self, RegisterOutcome::Added(_) | RegisterOutcome::Aliased(_))
    }
}

#[derive(Debug, Default)]
pub struct ScriptRegistry {
    next_id: u64,
    by_id: HashMap<String, Arc<Script>>,
    by_url: HashMap<ScriptUrl, Arc<Script>>,
    by_hash: HashMap<String, Arc<Script>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripts(&self) -> Vec<Arc<Script>> {
        let mut scripts: Vec<_> = self.by_id.values().cloned().collect();
        scripts.sort_by(|a, b| a.id.cmp(&b.id));
        scripts
    }

    pub fn by_id(&self, id: &str) -> Option<Arc<Script>> {
        self.by_id.get(id).cloned()
    }

    pub fn by_url(&self, url: &ScriptUrl) -> Option<Arc<Script>> {
        self.by_url.get(url).cloned()
    }

    /// Register recovered source under `url`, deduplicating recompilations
    /// by contents hash.
    pub fn register(&mut self, url: ScriptUrl, source: String) -> RegisterOutcome {
        if let Some(existing) = self.by_url.get(&url) {
            return RegisterOutcome::Existing(existing.clone());
        }

        let hash = {
            let mut hasher = Md5::new();
            hasher.update(source.as_bytes());
            hex::encode(hasher.finalize())
        };

        if let Some(existing) = self.by_hash.get(&hash) {
            let existing = existing.clone();
            self.by_url.insert(url, existing.clone());
            return RegisterOutcome::Aliased(existing);
        }

        self.next_id += 1;
        let script = Arc::new(Script::new(self.next_id.to_string(), url.clone(), source));
        self.by_id.insert(script.id.clone(), script.clone());
        self.by_url.insert(url, script.clone());
        self.by_hash.insert(hash, script.clone());
        RegisterOutcome::Added(script)
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_url.clear();
        self.by_hash.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> ScriptUrl {
        ScriptUrl::create(s).unwrap()
    }

    #[test]
    fn identical_sources_alias_to_one_script() {
        let mut registry = ScriptRegistry::new();
        let first = registry
            .register(url("/app/a.js"), "function f(){return 1}".to_string());
        assert!(matches!(first, RegisterOutcome::Added(_)));

        let second = registry
            .register(url("/app/b.js"), "function f(){return 1}".to_string());
        match &second {
            RegisterOutcome::Aliased(script) => {
                assert_eq!(script.id(), first.script().id());
            }
            other => panic!("expected alias, got {other:?}"),
        }

        assert_eq!(registry.scripts().len(), 1);
        assert!(Arc::ptr_eq(
            &registry.by_url(&url("/app/a.js")).unwrap(),
            &registry.by_url(&url("/app/b.js")).unwrap()
        ));
    }

    #[test]
    fn same_url_registers_once() {
        let mut registry = ScriptRegistry::new();
        registry.register(url("/app/a.js"), "var x = 1;".to_string());
        let again = registry.register(url("/app/a.js"), "var x = 1;".to_string());
        assert!(matches!(again, RegisterOutcome::Existing(_)));
        assert_eq!(registry.scripts().len(), 1);
    }

    #[test]
    fn hashes_differ_for_different_sources() {
        let mut registry = ScriptRegistry::new();
        let a = registry.register(url("/a.js"), "var x = 1;".to_string());
        let b = registry.register(url("/b.js"), "var x = 2;".to_string());
        assert_ne!(a.script().contents_hash(), b.script().contents_hash());
        assert_eq!(registry.scripts().len(), 2);
    }

    #[test]
    fn annotations_are_parsed() {
        let script = Script::new(
            "1".to_string(),
            url("/a.js"),
            "var x = 1;\n//# sourceMappingURL=a.js.map\n//@ sourceURL=orig.js\n".to_string(),
        );
        assert_eq!(script.source_map_url(), Some("a.js.map"));
        assert_eq!(script.source_url(), Some("orig.js"));
    }

    #[test]
    fn line_index_is_one_based() {
        let script = Script::new("1".to_string(), url("/a.js"), "a\nbb\nccc".to_string());
        assert_eq!(script.line_count(), 3);
        assert_eq!(script.line(1), Some("a"));
        assert_eq!(script.line(2), Some("bb"));
        assert_eq!(script.line(3), Some("ccc"));
        assert_eq!(script.line(4), None);
    }
}
