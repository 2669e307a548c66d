//! Jailed virtual paths
//!
//! Every path a client names is resolved into a [`RootedPath`]: a
//! normalized path relative to the configured root directory. `.` and
//! empty components disappear during normalization and `..` pops the last
//! component, clamping at the root, so a rooted path can never name
//! anything above the jail. The client-visible rendering is always a
//! `/`-separated absolute logical path and never leaks the host location.
//!
//! NIST 800-53 AC-3: path canonicalization confines all file access to
//! the authorized root.

use std::path::{Path, PathBuf};

/// Normalized path relative to the jail root. The root itself is the
/// empty relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootedPath {
    rel: PathBuf,
}

impl RootedPath {
    /// The jail root.
    pub fn root() -> Self {
        RootedPath {
            rel: PathBuf::new(),
        }
    }

    /// Resolves a client-supplied path string against the root.
    ///
    /// Leading `/` is irrelevant: relative client paths resolve from the
    /// virtual home, which is the root.
    pub fn parse(path: &str) -> Self {
        RootedPath::root().resolve(path)
    }

    /// Resolves a path string against this path. Absolute strings restart
    /// resolution from the root.
    pub fn resolve(&self, path: &str) -> Self {
        let mut stack: Vec<&str> = if path.starts_with('/') {
            Vec::new()
        } else {
            self.components().collect()
        };
        for component in path.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    // Clamp at the root.
                    stack.pop();
                }
                name => stack.push(name),
            }
        }
        let mut rel = PathBuf::new();
        for name in stack {
            rel.push(name);
        }
        RootedPath { rel }
    }

    /// Appends a single child component. The name must not contain `/`.
    pub fn child(&self, name: &str) -> Self {
        debug_assert!(!name.contains('/'));
        let mut rel = self.rel.clone();
        rel.push(name);
        RootedPath { rel }
    }

    /// True for the jail root.
    pub fn is_root(&self) -> bool {
        self.rel.as_os_str().is_empty()
    }

    /// Parent path; the root has none.
    pub fn parent(&self) -> Option<RootedPath> {
        if self.is_root() {
            return None;
        }
        self.rel.parent().map(|p| RootedPath {
            rel: p.to_path_buf(),
        })
    }

    /// Final component; the root's name is empty.
    pub fn file_name(&self) -> &str {
        self.rel
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
    }

    /// The jail-relative path, for joining onto the real root directory.
    pub fn as_rel_path(&self) -> &Path {
        &self.rel
    }

    fn components(&self) -> impl Iterator<Item = &str> {
        self.rel.iter().filter_map(|c| c.to_str())
    }

    /// Logical absolute path shown to the client. The root renders as
    /// `/`.
    pub fn to_client_string(&self) -> String {
        if self.is_root() {
            return "/".to_string();
        }
        let mut out = String::new();
        for component in self.components() {
            out.push('/');
            out.push_str(component);
        }
        out
    }
}

/// Builds a rooted path from an already-normalized relative path, e.g.
/// the result of stripping the root prefix off a canonicalized path.
pub(crate) fn from_normalized_rel(rel: PathBuf) -> RootedPath {
    RootedPath { rel }
}

impl std::fmt::Display for RootedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_client_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes() {
        assert_eq!(RootedPath::parse("/a/b/../c/./d").to_client_string(), "/a/c/d");
        assert_eq!(RootedPath::parse("a//b").to_client_string(), "/a/b");
    }

    #[test]
    fn test_dotdot_clamps_at_root() {
        assert!(RootedPath::parse("/..").is_root());
        assert!(RootedPath::parse("../../..").is_root());
        assert_eq!(
            RootedPath::parse("/../etc/passwd").to_client_string(),
            "/etc/passwd"
        );
        assert_eq!(RootedPath::parse("a/../../b").to_client_string(), "/b");
    }

    #[test]
    fn test_root_identity_independent_of_spelling() {
        assert_eq!(RootedPath::parse("/"), RootedPath::root());
        assert_eq!(RootedPath::parse(""), RootedPath::root());
        assert_eq!(RootedPath::parse("/a/.."), RootedPath::root());
        assert_eq!(RootedPath::parse("."), RootedPath::root());
    }

    #[test]
    fn test_root_renders_as_slash_and_has_no_parent() {
        let root = RootedPath::root();
        assert_eq!(root.to_client_string(), "/");
        assert_eq!(root.file_name(), "");
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_parent_chain() {
        let p = RootedPath::parse("/a/b/c");
        let parent = p.parent().unwrap();
        assert_eq!(parent.to_client_string(), "/a/b");
        assert_eq!(parent.parent().unwrap().to_client_string(), "/a");
        assert!(parent.parent().unwrap().parent().unwrap().is_root());
    }

    #[test]
    fn test_resolve_absolute_restarts() {
        let base = RootedPath::parse("/a/b");
        assert_eq!(base.resolve("c").to_client_string(), "/a/b/c");
        assert_eq!(base.resolve("/x/y").to_client_string(), "/x/y");
        assert_eq!(base.resolve("../z").to_client_string(), "/a/z");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(RootedPath::parse("/a/b.txt").file_name(), "b.txt");
    }
}
