//! Mirrors the upstream source-of-truth repository into a staging directory.
//!
//! Owns the staging tree exclusively: nothing else under the crate writes to it.
//! Clones on first use, fetches and fast-forwards thereafter. Never merges in a way
//! that would require rewriting history — a staging tree that has diverged from
//! upstream (e.g. someone committed into it by hand) is reported as `RepoStateError`
//! rather than silently reconciled.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::repo_sync::RepoSyncError;

pub struct RefreshOutcome {
    pub updated: bool,
    pub head: String,
}

pub struct DiffOutcome {
    pub changed_files: Vec<String>,
    pub removed_files: Vec<String>,
}

pub struct RepoSync;

impl RepoSync {
    pub fn new() -> Self {
        Self
    }

    /// Ensures `dest` exists and reflects `branch` of `url` at its latest commit.
    pub fn refresh(&self, url: &str, branch: &str, dest: &Path) -> Result<RefreshOutcome, RepoSyncError> {
        if !dest.exists() || std::fs::read_dir(dest)?.next().is_none() {
            return self.clone_fresh(url, branch, dest);
        }

        let repo = git2::Repository::open(dest).map_err(|source| RepoSyncError::RepoState {
            path: dest.to_path_buf(),
            source,
        })?;

        let head_before = repo
            .head()
            .ok()
            .and_then(|h| h.target())
            .map(|oid| oid.to_string());

        self.fetch_and_fast_forward(&repo, url, branch, dest)?;

        let head_after = repo
            .head()
            .map_err(|source| RepoSyncError::RepoState {
                path: dest.to_path_buf(),
                source,
            })?
            .target()
            .map(|oid| oid.to_string())
            .unwrap_or_default();

        Ok(RefreshOutcome {
            updated: head_before.as_deref() != Some(head_after.as_str()),
            head: head_after,
        })
    }

    fn clone_fresh(&self, url: &str, branch: &str, dest: &Path) -> Result<RefreshOutcome, RepoSyncError> {
        std::fs::create_dir_all(dest)?;

        let mut builder = git2::build::RepoBuilder::new();
        builder.branch(branch);
        let repo = builder
            .clone(url, dest)
            .map_err(|source| RepoSyncError::Network {
                url: url.to_string(),
                source,
            })?;

        let head = repo
            .head()
            .map_err(|source| RepoSyncError::RepoState {
                path: dest.to_path_buf(),
                source,
            })?
            .target()
            .map(|oid| oid.to_string())
            .unwrap_or_default();

        Ok(RefreshOutcome {
            updated: true,
            head,
        })
    }

    fn fetch_and_fast_forward(
        &self,
        repo: &git2::Repository,
        url: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<(), RepoSyncError> {
        let mut remote = repo
            .find_remote("origin")
            .or_else(|_| repo.remote("origin", url))
            .map_err(|source| RepoSyncError::RepoState {
                path: dest.to_path_buf(),
                source,
            })?;

        remote
            .fetch(&[branch], None, None)
            .map_err(|source| RepoSyncError::Network {
                url: url.to_string(),
                source,
            })?;

        let fetch_head = repo.find_reference("FETCH_HEAD").map_err(|source| RepoSyncError::RepoState {
            path: dest.to_path_buf(),
            source,
        })?;
        let fetch_commit = repo
            .reference_to_annotated_commit(&fetch_head)
            .map_err(|source| RepoSyncError::RepoState {
                path: dest.to_path_buf(),
                source,
            })?;

        let analysis = repo
            .merge_analysis(&[&fetch_commit])
            .map_err(|source| RepoSyncError::RepoState {
                path: dest.to_path_buf(),
                source,
            })?;

        if analysis.0.is_up_to_date() {
            return Ok(());
        }

        if !analysis.0.is_fast_forward() {
            return Err(RepoSyncError::RepoState {
                path: dest.to_path_buf(),
                source: git2::Error::from_str(
                    "staging tree has diverged from upstream; fast-forward not possible",
                ),
            });
        }

        let branch_ref = format!("refs/heads/{branch}");
        let mut reference = repo
            .find_reference(&branch_ref)
            .or_else(|_| repo.reference(&branch_ref, fetch_commit.id(), true, "fast-forward"))
            .map_err(|source| RepoSyncError::RepoState {
                path: dest.to_path_buf(),
                source,
            })?;

        reference
            .set_target(fetch_commit.id(), "fast-forward")
            .map_err(|source| RepoSyncError::RepoState {
                path: dest.to_path_buf(),
                source,
            })?;

        repo.set_head(&branch_ref).map_err(|source| RepoSyncError::RepoState {
            path: dest.to_path_buf(),
            source,
        })?;

        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
            .map_err(|source| RepoSyncError::RepoState {
                path: dest.to_path_buf(),
                source,
            })?;

        Ok(())
    }

    /// Computes which files under `subpath` differ or are missing between the
    /// staging and installed trees, comparing by content hash.
    pub fn diff_subtree(
        &self,
        staging: &Path,
        installed: &Path,
        subpath: &Path,
    ) -> Result<DiffOutcome, RepoSyncError> {
        let staging_root = staging.join(subpath);
        let installed_root = installed.join(subpath);

        let mut changed_files = Vec::new();
        let mut removed_files = Vec::new();

        if !staging_root.exists() {
            return Ok(DiffOutcome {
                changed_files,
                removed_files,
            });
        }

        for entry in walkdir::WalkDir::new(&staging_root) {
            let entry = entry.map_err(|err| {
                RepoSyncError::Io(std::io::Error::other(err.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&staging_root)
                .expect("entry is under staging_root")
                .to_path_buf();

            let staging_hash = hash_file(entry.path())?;
            let installed_path = installed_root.join(&rel);
            let matches = installed_path
                .exists()
                .then(|| hash_file(&installed_path))
                .transpose()?
                .map(|installed_hash| installed_hash == staging_hash)
                .unwrap_or(false);

            if !matches {
                changed_files.push(rel.to_string_lossy().into_owned());
            }
        }

        if installed_root.exists() {
            for entry in walkdir::WalkDir::new(&installed_root) {
                let entry = entry.map_err(|err| {
                    RepoSyncError::Io(std::io::Error::other(err.to_string()))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&installed_root)
                    .expect("entry is under installed_root")
                    .to_path_buf();
                if !staging_root.join(&rel).exists() {
                    removed_files.push(rel.to_string_lossy().into_owned());
                }
            }
        }

        Ok(DiffOutcome {
            changed_files,
            removed_files,
        })
    }
}

impl Default for RepoSync {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_file(path: &Path) -> Result<String, RepoSyncError> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn diff_subtree_reports_changed_and_removed_files() {
        let staging = tempfile::tempdir().unwrap();
        let installed = tempfile::tempdir().unwrap();

        fs::create_dir_all(staging.path().join("modules/x")).unwrap();
        fs::create_dir_all(installed.path().join("modules/x")).unwrap();

        fs::write(staging.path().join("modules/x/index.json"), "v2").unwrap();
        fs::write(installed.path().join("modules/x/index.json"), "v1").unwrap();
        fs::write(installed.path().join("modules/x/stale.txt"), "gone").unwrap();

        let diff = RepoSync::new()
            .diff_subtree(staging.path(), installed.path(), Path::new("modules/x"))
            .unwrap();

        assert_eq!(diff.changed_files, vec!["index.json".to_string()]);
        assert_eq!(diff.removed_files, vec!["stale.txt".to_string()]);
    }

    #[test]
    fn diff_subtree_on_identical_trees_is_empty() {
        let staging = tempfile::tempdir().unwrap();
        let installed = tempfile::tempdir().unwrap();
        fs::create_dir_all(staging.path().join("modules/x")).unwrap();
        fs::create_dir_all(installed.path().join("modules/x")).unwrap();
        fs::write(staging.path().join("modules/x/index.json"), "same").unwrap();
        fs::write(installed.path().join("modules/x/index.json"), "same").unwrap();

        let diff = RepoSync::new()
            .diff_subtree(staging.path(), installed.path(), Path::new("modules/x"))
            .unwrap();

        assert!(diff.changed_files.is_empty());
        assert!(diff.removed_files.is_empty());
    }
}
