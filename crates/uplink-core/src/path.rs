//! Virtual path containment
//!
//! Clients address files inside a virtual namespace. Nothing exists on disk,
//! so resolution is purely lexical: `.` and `..` segments are folded away and
//! the result is compared segment-by-segment against the configured root.

use crate::MAX_PATH_LEN;

/// Lexically clean a virtual path and force it absolute.
///
/// Repeated separators collapse, `.` segments vanish and `..` pops the
/// previous segment. A `..` at the root stays at the root.
pub fn clean(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name),
        }
    }

    let mut cleaned = String::with_capacity(path.len() + 1);
    cleaned.push('/');
    cleaned.push_str(&segments.join("/"));
    cleaned
}

/// Decides whether a requested virtual path lies inside the configured root
#[derive(Clone, Debug)]
pub struct PathGuard {
    root: String,
}

impl PathGuard {
    pub fn new(root: &str) -> Self {
        Self { root: clean(root) }
    }

    /// The cleaned virtual root
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Path of `path` relative to the root, or `None` when it lies outside.
    ///
    /// The root itself is returned as `"."`.
    pub fn relative(&self, path: &str) -> Option<String> {
        let cleaned = clean(path);

        if self.root == "/" {
            let rel = cleaned.trim_start_matches('/');
            return Some(if rel.is_empty() { ".".into() } else { rel.into() });
        }

        let rest = cleaned.strip_prefix(self.root.as_str())?;
        if rest.is_empty() {
            return Some(".".into());
        }
        // "/uploads_other" shares a string prefix with "/uploads" but is a sibling
        rest.strip_prefix('/').map(str::to_string)
    }

    /// True iff `path` resolves to the root or somewhere beneath it
    pub fn allowed(&self, path: &str) -> bool {
        if path.contains('\0') || path.len() > MAX_PATH_LEN {
            return false;
        }
        self.relative(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> PathGuard {
        PathGuard::new("/uploads")
    }

    #[test]
    fn test_clean() {
        assert_eq!(clean(""), "/");
        assert_eq!(clean("/"), "/");
        assert_eq!(clean("uploads/file.txt"), "/uploads/file.txt");
        assert_eq!(clean("//uploads///a/./b/"), "/uploads/a/b");
        assert_eq!(clean("/uploads/a/../b"), "/uploads/b");
        assert_eq!(clean("/../../etc"), "/etc");
    }

    #[test]
    fn test_allowed_inside_root() {
        let g = guard();
        assert!(g.allowed("/uploads/file.txt"));
        assert!(g.allowed("/uploads/subfolder/file.txt"));
        assert!(g.allowed("/uploads"));
        assert!(g.allowed("/uploads/"));
        assert!(g.allowed("uploads/relative.txt"));
        assert!(g.allowed("/uploads/my..file.txt"));
        assert!(g.allowed("/uploads/a/../b.txt"));
    }

    #[test]
    fn test_rejects_outside_root() {
        let g = guard();
        assert!(!g.allowed("/etc/passwd"));
        assert!(!g.allowed("/"));
        assert!(!g.allowed(""));
        assert!(!g.allowed("/uploads_other/file.txt"));
        assert!(!g.allowed("/uploadsfile.txt"));
    }

    #[test]
    fn test_rejects_traversal() {
        let g = guard();
        assert!(!g.allowed("/uploads/../etc/passwd"));
        assert!(!g.allowed("/uploads/../../etc/passwd"));
        assert!(!g.allowed("/uploads/a/../../etc"));
        assert!(!g.allowed("/uploads/./../uploads_other/x"));
        assert!(!g.allowed("/uploads/.."));

        for depth in 1..20 {
            let path = format!("/uploads/{}etc/shadow", "../".repeat(depth));
            assert!(!g.allowed(&path), "{} should be rejected", path);
        }
    }

    #[test]
    fn test_rejects_null_and_overlong() {
        let g = guard();
        assert!(!g.allowed("/uploads/file\0.txt"));

        let long = format!("/uploads/{}", "a".repeat(MAX_PATH_LEN));
        assert!(!g.allowed(&long));
    }

    #[test]
    fn test_custom_root() {
        let g = PathGuard::new("/custom/upload/path");
        assert!(g.allowed("/custom/upload/path/file.txt"));
        assert!(!g.allowed("/custom/upload/other/file.txt"));
        assert!(!g.allowed("/uploads/file.txt"));
    }

    #[test]
    fn test_root_is_cleaned() {
        let g = PathGuard::new("uploads/./inbox/");
        assert_eq!(g.root(), "/uploads/inbox");
        assert!(g.allowed("/uploads/inbox/a.csv"));
    }

    #[test]
    fn test_slash_root_allows_everything() {
        let g = PathGuard::new("/");
        assert!(g.allowed("/"));
        assert!(g.allowed("/etc/passwd"));
        assert!(g.allowed("/../x"));
        assert_eq!(g.relative("/a/b").as_deref(), Some("a/b"));
    }

    #[test]
    fn test_relative() {
        let g = guard();
        assert_eq!(g.relative("/uploads").as_deref(), Some("."));
        assert_eq!(g.relative("/uploads/a/b.txt").as_deref(), Some("a/b.txt"));
        assert_eq!(g.relative("/etc"), None);
    }
}
