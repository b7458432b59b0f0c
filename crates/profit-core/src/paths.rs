//! Lexical path helpers. Nothing here touches the filesystem.

use std::path::{Component, Path, PathBuf};

/// Resolve `.` and `..` segments syntactically.
///
/// A `..` that would climb above the start of a relative path is kept,
/// so callers can detect escapes. An absolute path never climbs above `/`.
pub fn normalize(path: impl AsRef<Path>) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for comp in path.as_ref().components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(comp),
            },
            other => out.push(other),
        }
    }
    out.iter().map(|c| c.as_os_str()).collect()
}

/// Segments of `path` below `root`, or `None` if `path` resolves outside it.
///
/// Relative paths are taken relative to `root`. An empty result names the
/// root itself.
pub fn relative_segments(root: &Path, path: impl AsRef<Path>) -> Option<Vec<String>> {
    let root = normalize(root);
    let full = normalize(root.join(path.as_ref()));
    let rel = full.strip_prefix(&root).ok()?;
    let mut segments = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => segments.push(s.to_string_lossy().into_owned()),
            _ => return None,
        }
    }
    Some(segments)
}

/// `root` joined with `path`, provided the result stays under `root`.
pub fn resolve_under(root: &Path, path: impl AsRef<Path>) -> Option<PathBuf> {
    let segments = relative_segments(root, path)?;
    let mut out = normalize(root);
    out.extend(segments);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(normalize("a/../a/b"), PathBuf::from("a/b"));
        assert_eq!(normalize("./a/./b/"), PathBuf::from("a/b"));
        assert_eq!(normalize("/../x"), PathBuf::from("/x"));
        assert_eq!(normalize("../x"), PathBuf::from("../x"));
    }

    #[test]
    fn relative_segments_accepts_children() {
        let root = Path::new("/srv/root");
        assert_eq!(
            relative_segments(root, "a/../a/b"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            relative_segments(root, "/srv/root/x/y"),
            Some(vec!["x".to_string(), "y".to_string()])
        );
        assert_eq!(relative_segments(root, ""), Some(vec![]));
    }

    #[test]
    fn relative_segments_rejects_escapes() {
        let root = Path::new("/srv/root");
        assert_eq!(relative_segments(root, "../other"), None);
        assert_eq!(relative_segments(root, "/srv/rootless/a"), None);
        assert_eq!(relative_segments(root, "/etc/passwd"), None);
    }

    #[test]
    fn resolve_under_joins_normalised() {
        let root = Path::new("/srv/root");
        assert_eq!(
            resolve_under(root, "batch/./job"),
            Some(PathBuf::from("/srv/root/batch/job"))
        );
        assert_eq!(resolve_under(root, "a/../../b"), None);
    }
}
