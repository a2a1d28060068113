//! Working directory resolution for new sessions.

use std::path::{Path, PathBuf};

/// Pick the directory a new session starts in.
///
/// Fallback chain: explicit cwd, then project path, then `home`, then `/`.
/// A candidate is used only if it is absolute and an existing directory;
/// anything else silently falls through to the next one.
pub fn resolve_cwd(explicit: Option<&str>, project: Option<&str>, home: Option<PathBuf>) -> PathBuf {
    explicit
        .and_then(usable_dir)
        .or_else(|| project.and_then(usable_dir))
        .or_else(|| home.filter(|h| h.is_absolute() && h.is_dir()))
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn usable_dir(candidate: &str) -> Option<PathBuf> {
    let path = Path::new(candidate);
    if path.is_absolute() && path.is_dir() {
        Some(path.to_path_buf())
    } else {
        if !candidate.is_empty() {
            log::debug!("ignoring unusable working directory {candidate:?}");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_str(dir: &tempfile::TempDir) -> String {
        dir.path().to_string_lossy().into_owned()
    }

    #[test]
    fn test_explicit_cwd_wins() {
        let cwd = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let resolved = resolve_cwd(Some(&dir_str(&cwd)), Some(&dir_str(&project)), None);
        assert_eq!(resolved, cwd.path());
    }

    #[test]
    fn test_relative_cwd_falls_back_to_project() {
        let project = tempfile::tempdir().unwrap();
        let resolved = resolve_cwd(Some("some/relative/dir"), Some(&dir_str(&project)), None);
        assert_eq!(resolved, project.path());
    }

    #[test]
    fn test_missing_cwd_falls_back_to_home() {
        let home = tempfile::tempdir().unwrap();
        let resolved = resolve_cwd(
            Some("/does/not/exist/anywhere"),
            Some("relative-project"),
            Some(home.path().to_path_buf()),
        );
        assert_eq!(resolved, home.path());
    }

    #[test]
    fn test_file_is_not_a_directory() {
        let home = tempfile::tempdir().unwrap();
        let file = home.path().join("notes.txt");
        std::fs::write(&file, "x").unwrap();
        let resolved = resolve_cwd(
            Some(&file.to_string_lossy()),
            None,
            Some(home.path().to_path_buf()),
        );
        assert_eq!(resolved, home.path());
    }

    #[test]
    fn test_everything_missing_uses_root() {
        assert_eq!(resolve_cwd(None, None, None), PathBuf::from("/"));
        assert_eq!(
            resolve_cwd(Some(""), None, Some(PathBuf::from("relative-home"))),
            PathBuf::from("/")
        );
    }
}
