// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Path confinement for client-supplied file names.

use std::path::{Component, Path, PathBuf};

/// Returns true if `name` is exactly one normal path component.
///
/// Rejects empty names, `.`/`..`, anything containing a separator and
/// absolute paths on every platform.
pub fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains('\0') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Resolve `name` inside `root`, or `None` if it would land anywhere else.
///
/// The joined path is canonicalized when it exists so a symlink inside the
/// root that points outside it is rejected as well.
pub fn confine(root: &Path, name: &str) -> Option<PathBuf> {
    if !is_plain_file_name(name) {
        return None;
    }
    let candidate = root.join(name);
    match (candidate.canonicalize(), root.canonicalize()) {
        (Ok(resolved), Ok(root)) => resolved.starts_with(&root).then_some(resolved),
        // Missing file: the name itself is already a single component.
        _ => Some(candidate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names() {
        assert!(is_plain_file_name("My_Book.epub"));
        assert!(is_plain_file_name("...epub"));
        assert!(!is_plain_file_name(""));
        assert!(!is_plain_file_name("."));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name("../../etc/passwd"));
        assert!(!is_plain_file_name("/etc/passwd"));
        assert!(!is_plain_file_name("sub/file.pdf"));
        assert!(!is_plain_file_name("..\\win.ini"));
    }

    #[test]
    fn test_confine_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(confine(dir.path(), "../../etc/passwd").is_none());
        assert!(confine(dir.path(), "..").is_none());
    }

    #[test]
    fn test_confine_existing_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF-1.4").unwrap();

        let found = confine(dir.path(), "a.pdf").unwrap();
        assert!(found.ends_with("a.pdf"));

        let missing = confine(dir.path(), "b.pdf").unwrap();
        assert_eq!(missing, dir.path().join("b.pdf"));
    }

    #[cfg(unix)]
    #[test]
    fn test_confine_rejects_escaping_symlink() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            root.path().join("link.txt"),
        )
        .unwrap();

        assert!(confine(root.path(), "link.txt").is_none());
    }
}
