//! Sandboxed filesystem browsing and launcher profile helpers.

use std::path::Path;

use log::warn;
use serde::Serialize;
use tokio::fs;

use crate::error::{HubError, HubResult};
use crate::sandbox;

/// Result of browsing a directory inside the sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    /// Normalized absolute path that was listed.
    pub path: String,
    /// Subdirectory names, ascending lexicographic.
    pub directories: Vec<String>,
}

/// List the subdirectories of `path`, restricted to the allowed roots.
///
/// Dot-prefixed entries and regular files are excluded. A path outside the
/// roots is an authorization failure, which callers report differently from
/// a missing directory.
pub async fn browse(path: &Path, roots: &[String]) -> HubResult<Listing> {
    let normalized = sandbox::ensure_allowed(path, roots)?;

    let metadata = fs::metadata(&normalized)
        .await
        .map_err(|_| HubError::NotFound(normalized.display().to_string()))?;
    if !metadata.is_dir() {
        return Err(HubError::NotADirectory(normalized.display().to_string()));
    }

    let mut directories = Vec::new();
    let mut entries = fs::read_dir(&normalized).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().await?.is_dir() {
            directories.push(name);
        }
    }
    directories.sort();

    Ok(Listing {
        path: normalized.display().to_string(),
        directories,
    })
}

/// List launcher config profiles: the subdirectories of the config root.
///
/// An unset or missing root yields an empty list rather than an error; the
/// dashboard stays usable without profiles.
pub async fn list_profiles(host_config_root: Option<&str>) -> Vec<String> {
    let Some(root) = host_config_root else {
        return Vec::new();
    };

    let mut profiles = Vec::new();
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    profiles.push(entry.file_name().to_string_lossy().to_string());
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error listing profiles in {}: {}", root, e);
                break;
            }
        }
    }
    profiles.sort();
    profiles
}

/// Read the extra launcher arguments declared by a profile.
///
/// The profile directory may carry an `extra-args` file with one argument
/// per line; blanks and `#` comments are skipped. Missing files yield an
/// empty list.
pub async fn profile_extra_args(host_config_root: Option<&str>, name: &str) -> Vec<String> {
    let Some(root) = host_config_root else {
        return Vec::new();
    };
    if name.is_empty() {
        return Vec::new();
    }

    let path = Path::new(root).join(name).join("extra-args");
    let contents = match fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(_) => return Vec::new(),
    };

    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_browse_lists_only_visible_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("beta")).unwrap();
        std::fs::create_dir(dir.path().join("alpha")).unwrap();
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();

        let roots = vec![dir.path().display().to_string()];
        let listing = browse(dir.path(), &roots).await.unwrap();
        assert_eq!(listing.directories, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_browse_outside_roots_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().join("inner").display().to_string()];
        let err = browse(dir.path(), &roots).await.unwrap_err();
        assert!(err.is_forbidden());
    }

    #[tokio::test]
    async fn test_browse_file_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, "x").unwrap();

        let roots = vec![dir.path().display().to_string()];
        let err = browse(&file, &roots).await.unwrap_err();
        assert!(matches!(err, HubError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_browse_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().display().to_string()];
        let err = browse(&dir.path().join("gone"), &roots).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_profiles_sorted_dirs_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("work")).unwrap();
        std::fs::create_dir(dir.path().join("personal")).unwrap();
        std::fs::write(dir.path().join("notes"), "x").unwrap();

        let root = dir.path().display().to_string();
        let profiles = list_profiles(Some(&root)).await;
        assert_eq!(profiles, vec!["personal", "work"]);

        assert!(list_profiles(None).await.is_empty());
        assert!(list_profiles(Some("/nonexistent-root")).await.is_empty());
    }

    #[tokio::test]
    async fn test_profile_extra_args_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("work");
        std::fs::create_dir(&profile).unwrap();
        std::fs::write(
            profile.join("extra-args"),
            "--mount-ssh\n\n# comment\n  --verbose  \n",
        )
        .unwrap();

        let root = dir.path().display().to_string();
        let args = profile_extra_args(Some(&root), "work").await;
        assert_eq!(args, vec!["--mount-ssh", "--verbose"]);

        assert!(profile_extra_args(Some(&root), "missing").await.is_empty());
        assert!(profile_extra_args(Some(&root), "").await.is_empty());
    }
}
