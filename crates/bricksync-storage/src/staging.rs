use std::path::Path;

use anyhow::Context;
use tokio::fs;
use tracing::{debug, info};

/// Marker kept in the staging directory so it survives in version control.
pub const STAGING_MARKER: &str = ".gitkeep";

/// Remove every regular file in `dir` except the marker. Subdirectories are
/// left alone. A missing directory counts as already clean.
pub async fn clean_staging_dir(dir: &Path) -> anyhow::Result<usize> {
    if !fs::try_exists(dir)
        .await
        .with_context(|| format!("checking staging directory {}", dir.display()))?
    {
        return Ok(0);
    }

    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading staging directory {}", dir.display()))?;
    let mut removed = 0usize;

    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing staging directory {}", dir.display()))?
    {
        if entry.file_name() == STAGING_MARKER {
            continue;
        }
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("inspecting {}", entry.path().display()))?;
        if !file_type.is_file() {
            continue;
        }
        fs::remove_file(entry.path())
            .await
            .with_context(|| format!("removing staged file {}", entry.path().display()))?;
        debug!(path = %entry.path().display(), "removed staged file");
        removed += 1;
    }

    info!(dir = %dir.display(), removed, "staging directory cleaned");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn cleanup_keeps_marker_and_subdirectories() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join(STAGING_MARKER), b"").unwrap();
        std::fs::write(dir.path().join("sets.csv"), b"set_num,name\n").unwrap();
        std::fs::write(dir.path().join("themes.csv"), b"id,name\n").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let removed = clean_staging_dir(dir.path()).await.expect("cleanup");

        assert_eq!(removed, 2);
        assert!(dir.path().join(STAGING_MARKER).exists());
        assert!(dir.path().join("nested").is_dir());
        assert!(!dir.path().join("sets.csv").exists());
    }

    #[tokio::test]
    async fn missing_directory_is_already_clean() {
        let dir = tempdir().expect("tempdir");
        let removed = clean_staging_dir(&dir.path().join("absent")).await.unwrap();
        assert_eq!(removed, 0);
    }
}
