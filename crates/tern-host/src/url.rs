//! Script URL normalization.
//!
//! Script identities arrive in several spellings: absolute file paths
//! (Windows or Unix), `file:` URLs with one or three slashes, synthetic
//! `eval:` paths derived from engine class names, and passthrough `data:` /
//! `http(s):` URLs. [`ScriptUrl::create`] coerces all of them into one
//! canonical form so the same script never registers under two spellings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};

/// A normalized script URL. Normalization is idempotent:
/// `create(u.to_string()) == u` for every valid `u`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptUrl(String);

impl ScriptUrl {
    pub fn create(input: &str) -> HostResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(HostError::InvalidUrl("empty URL".to_string()));
        }

        if input.starts_with("data:")
            || input.starts_with("http://")
            || input.starts_with("https://")
        {
            return Ok(Self(input.to_string()));
        }

        if let Some(rest) = input.strip_prefix("eval:") {
            let path = rest.trim_start_matches('/');
            return Ok(Self(format!("eval:///{path}")));
        }

        let (from_file_scheme, path) = match input.strip_prefix("file:") {
            Some(rest) => (true, rest.trim_start_matches('/').to_string()),
            None => (false, input.to_string()),
        };

        let path = path.replace('\\', "/");
        let path = if is_windows_absolute(&path) {
            path
        } else if from_file_scheme {
            // `file:` URLs are absolute by construction; re-add the slash the
            // prefix stripping removed.
            format!("/{}", path)
        } else if path.starts_with('/') {
            path
        } else {
            return Err(HostError::InvalidUrl(format!(
                "relative paths are not accepted: {input}"
            )));
        };

        Ok(Self(format!("file:///{}", resolve_dot_segments(&path))))
    }

    /// Resolve `relative` against this URL, for `sourceMappingURL` and
    /// `sourceURL` annotations that are not absolute themselves.
    pub fn resolve(&self, relative: &str) -> HostResult<Self> {
        if ScriptUrl::create(relative).is_ok() {
            return ScriptUrl::create(relative);
        }
        let base = match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        };
        ScriptUrl::create(&format!("{base}/{relative}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_eval(&self) -> bool {
        self.0.starts_with("eval:")
    }
}

impl fmt::Display for ScriptUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_windows_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Resolve `.` and `..` segments. The input is an absolute path (leading `/`
/// already stripped for Windows drive paths).
fn resolve_dot_segments(path: &str) -> String {
    let (prefix, rest) = if is_windows_absolute(path) {
        let (drive, rest) = path.split_at(2);
        (drive.to_string(), rest)
    } else {
        (String::new(), path)
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut out = prefix;
    if out.is_empty() {
        // Unix form keeps no drive prefix; the caller adds `file:///`.
        out.push_str(&segments.join("/"));
    } else {
        out.push('/');
        out.push_str(&segments.join("/"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(input: &str) -> String {
        ScriptUrl::create(input).unwrap().to_string()
    }

    #[test]
    fn unix_paths_normalize_to_file_urls() {
        assert_eq!(url("/some/script.js"), "file:///some/script.js");
        assert_eq!(url("file:/some/script.js"), "file:///some/script.js");
        assert_eq!(url("file:///some/script.js"), "file:///some/script.js");
    }

    #[test]
    fn windows_paths_normalize_to_file_urls() {
        assert_eq!(url("c:\\scripts\\app.js"), "file:///c:/scripts/app.js");
        assert_eq!(url("file:///c:/scripts/app.js"), "file:///c:/scripts/app.js");
    }

    #[test]
    fn dot_segments_are_resolved() {
        assert_eq!(url("/a/b/../c/./d.js"), "file:///a/c/d.js");
    }

    #[test]
    fn eval_and_passthrough_schemes() {
        assert_eq!(url("eval:/tools/repl"), "eval:///tools/repl");
        assert_eq!(url("eval:///tools/repl"), "eval:///tools/repl");
        assert_eq!(url("data:text/plain,hi"), "data:text/plain,hi");
        assert_eq!(url("http://host/x.js"), "http://host/x.js");
        assert_eq!(url("https://host/x.js"), "https://host/x.js");
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert!(ScriptUrl::create("scripts/app.js").is_err());
        assert!(ScriptUrl::create("").is_err());
    }

    #[test]
    fn normalization_round_trips() {
        for input in [
            "/some/script.js",
            "c:\\scripts\\app.js",
            "eval:/tools/repl",
            "data:text/plain,hi",
            "http://host/x.js",
        ] {
            let once = ScriptUrl::create(input).unwrap();
            let twice = ScriptUrl::create(once.as_str()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn resolve_relative_annotation() {
        let base = ScriptUrl::create("/scripts/app.js").unwrap();
        assert_eq!(
            base.resolve("app.js.map").unwrap().to_string(),
            "file:///scripts/app.js.map"
        );
        assert_eq!(
            base.resolve("http://host/m.map").unwrap().to_string(),
            "http://host/m.map"
        );
    }
}
