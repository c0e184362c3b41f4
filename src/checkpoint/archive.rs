//! Plan files kept next to their checkpoints, so a resume can rebuild the
//! exact plan a run started with from nothing but its id.
//!
//! One file per plan id: `<id>.plan.<ext>`, where `<ext>` is the source
//! file's extension (`toml` or `json`).

use super::store::{check_plan_id, write_atomic};
use crate::models::StoreError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PlanArchive {
    dir: PathBuf,
}

impl PlanArchive {
    /// Open (creating if needed) an archive rooted at `dir`.
    pub fn new(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| StoreError::io("creating archive dir", dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `source` is archived for `plan_id`.
    pub fn path_for(&self, plan_id: &str, source: &Path) -> PathBuf {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("toml");
        self.dir.join(format!("{plan_id}.plan.{ext}"))
    }

    fn archived(&self, plan_id: &str) -> Result<Vec<PathBuf>, StoreError> {
        let pattern = format!(
            "{}/{plan_id}.plan.*",
            glob::Pattern::escape(&self.dir.to_string_lossy())
        );
        let paths = glob::glob(&pattern).map_err(|e| StoreError::Corrupt {
            path: self.dir.clone(),
            reason: format!("invalid glob pattern: {e}"),
        })?;
        Ok(paths.filter_map(|p| p.ok()).collect())
    }

    /// The archived plan file for `plan_id`. More than one candidate is an
    /// error rather than a guess.
    pub fn find(&self, plan_id: &str) -> Result<Option<PathBuf>, StoreError> {
        check_plan_id(plan_id)?;
        let mut paths = self.archived(plan_id)?;
        match paths.len() {
            0 => Ok(None),
            1 => Ok(paths.pop()),
            _ => Err(StoreError::Corrupt {
                path: self.dir.clone(),
                reason: format!(
                    "several archived plan files for '{plan_id}': {}",
                    paths
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }),
        }
    }

    /// Archive `source` for `plan_id`, replacing any earlier copy.
    ///
    /// The source is read in full before the archive is replaced, so
    /// archiving the archived file itself leaves it intact.
    pub fn store(&self, plan_id: &str, source: &Path) -> Result<PathBuf, StoreError> {
        check_plan_id(plan_id)?;
        let target = self.path_for(plan_id, source);
        let content =
            fs::read(source).map_err(|e| StoreError::io("reading plan file", source, e))?;

        if !same_file(source, &target) {
            let temp = self.dir.join(format!(".{plan_id}.plan.tmp"));
            write_atomic(&target, &temp, &content)?;
        }

        for stale in self.archived(plan_id)? {
            if stale != target {
                remove_if_exists(&stale)?;
            }
        }

        debug!(plan_id, path = %target.display(), "Plan file archived");
        Ok(target)
    }

    /// Remove every archived copy. Returns whether anything was there.
    pub fn remove(&self, plan_id: &str) -> Result<bool, StoreError> {
        check_plan_id(plan_id)?;
        let paths = self.archived(plan_id)?;
        for path in &paths {
            remove_if_exists(path)?;
        }
        Ok(!paths.is_empty())
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io("removing archived plan", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PLAN: &str = "id = \"lt-7\"\n\n[[phase]]\nname = \"leave\"\n";

    #[test]
    fn test_store_and_find() {
        let temp_dir = TempDir::new().unwrap();
        let archive = PlanArchive::new(&temp_dir.path().join("store")).unwrap();
        let source = temp_dir.path().join("lt-7.toml");
        fs::write(&source, PLAN).unwrap();

        assert!(archive.find("lt-7").unwrap().is_none());
        let path = archive.store("lt-7", &source).unwrap();
        assert_eq!(path, archive.dir().join("lt-7.plan.toml"));
        assert_eq!(archive.find("lt-7").unwrap(), Some(path.clone()));
        assert_eq!(fs::read_to_string(&path).unwrap(), PLAN);

        assert!(archive.remove("lt-7").unwrap());
        assert!(!archive.remove("lt-7").unwrap());
        assert!(archive.find("lt-7").unwrap().is_none());
    }

    #[test]
    fn test_archiving_the_archived_file_keeps_its_content() {
        let temp_dir = TempDir::new().unwrap();
        let archive = PlanArchive::new(temp_dir.path()).unwrap();
        let source = temp_dir.path().join("lt-7.toml");
        fs::write(&source, PLAN).unwrap();

        let archived = archive.store("lt-7", &source).unwrap();
        let again = archive.store("lt-7", &archived).unwrap();

        assert_eq!(again, archived);
        assert_eq!(fs::read_to_string(&archived).unwrap(), PLAN);
    }

    #[test]
    fn test_archiving_other_format_replaces_old_copy() {
        let temp_dir = TempDir::new().unwrap();
        let archive = PlanArchive::new(&temp_dir.path().join("store")).unwrap();
        let toml = temp_dir.path().join("plan.toml");
        let json = temp_dir.path().join("plan.json");
        fs::write(&toml, PLAN).unwrap();
        fs::write(&json, r#"{"id": "lt-7", "phase": []}"#).unwrap();

        archive.store("lt-7", &toml).unwrap();
        let path = archive.store("lt-7", &json).unwrap();

        assert_eq!(archive.find("lt-7").unwrap(), Some(path));
        assert!(!archive.dir().join("lt-7.plan.toml").exists());
    }

    #[test]
    fn test_find_rejects_several_copies() {
        let temp_dir = TempDir::new().unwrap();
        let archive = PlanArchive::new(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("lt-7.plan.toml"), PLAN).unwrap();
        fs::write(temp_dir.path().join("lt-7.plan.json"), "{}").unwrap();

        assert!(matches!(
            archive.find("lt-7"),
            Err(StoreError::Corrupt { .. })
        ));
        // Other plans are unaffected
        assert!(archive.find("lt-70").unwrap().is_none());
    }
}
