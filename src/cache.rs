//! Resource cache.
//!
//! Makes a configured resource available as a local directory:
//!
//! - **local** resources are used in place; only their existence is checked.
//! - **git** resources live at `<resources_dir>/<name>`. The first `ensure`
//!   clones into a temporary sibling directory and renames it into place, so
//!   a failed clone never leaves a half-written working copy behind. Later
//!   calls fetch and hard-reset to the tip of the configured branch. A
//!   working copy whose `origin` no longer matches the configured URL is
//!   thrown away and cloned again.
//!
//! At most one `ensure` per resource name runs at a time; different names
//! proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::ResourceError;
use crate::git;
use crate::models::{CachedResource, ResourceDefinition};
use crate::validate::{validate_definition, validate_name};

pub struct ResourceCache {
    resources_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResourceCache {
    pub fn new(resources_dir: impl Into<PathBuf>) -> Self {
        Self {
            resources_dir: resources_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn resources_dir(&self) -> &Path {
        &self.resources_dir
    }

    /// Cache directory a git resource with this name occupies.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.resources_dir.join(name)
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ensure the resource has a usable local directory and return it.
    ///
    /// Validation runs before anything touches the filesystem or spawns
    /// `git`; a validation failure is never worth retrying.
    pub async fn ensure(&self, def: &ResourceDefinition) -> Result<CachedResource, ResourceError> {
        let def = validate_definition(def)?;

        match &def {
            ResourceDefinition::Local { name, path, .. } => {
                if !path.is_dir() {
                    return Err(ResourceError::NotFound {
                        name: name.clone(),
                        path: path.clone(),
                    });
                }
                tracing::debug!(resource = %name, path = %path.display(), "using local resource");
                Ok(CachedResource {
                    name: name.clone(),
                    path: path.clone(),
                })
            }
            ResourceDefinition::Git {
                name,
                url,
                branch,
                search_paths,
                ..
            } => self.sync_git_locked(name, url, branch, search_paths).await,
        }
    }

    async fn sync_git_locked(
        &self,
        name: &str,
        url: &str,
        branch: &str,
        search_paths: &[String],
    ) -> Result<CachedResource, ResourceError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.sync_git(name, url, branch, search_paths).await
    }

    async fn sync_git(
        &self,
        name: &str,
        url: &str,
        branch: &str,
        search_paths: &[String],
    ) -> Result<CachedResource, ResourceError> {
        let dest = self.path_for(name);

        if git::is_git_repo(&dest) {
            match git::remote_url(name, &dest).await {
                Ok(current) if current == url => {}
                Ok(current) => {
                    tracing::warn!(resource = %name, previous = %current, url = %url, "remote changed, recloning");
                    discard(name, &dest).await?;
                }
                Err(err) => {
                    tracing::warn!(resource = %name, error = %err, "unreadable remote, recloning");
                    discard(name, &dest).await?;
                }
            }
        } else if dest.exists() {
            tracing::warn!(resource = %name, path = %dest.display(), "discarding cache directory without a working copy");
            discard(name, &dest).await?;
        }

        if git::is_git_repo(&dest) {
            tracing::info!(resource = %name, branch = %branch, "refreshing cached resource");
            if search_paths.is_empty() {
                git::sparse_checkout_disable(name, &dest).await?;
            } else {
                git::sparse_checkout_set(name, &dest, search_paths).await?;
            }
            git::refresh(name, &dest, branch).await?;
        } else {
            tracing::info!(resource = %name, url = %url, branch = %branch, "cloning resource");
            tokio::fs::create_dir_all(&self.resources_dir)
                .await
                .map_err(|source| io_error(name, "create resources directory", source))?;

            let staging = self
                .resources_dir
                .join(format!(".tmp-{}-{}", name, Uuid::new_v4()));

            let cloned = match git::clone(name, url, branch, search_paths, &staging).await {
                Ok(()) => tokio::fs::rename(&staging, &dest)
                    .await
                    .map_err(|source| io_error(name, "move clone into place", source)),
                Err(err) => Err(err),
            };
            if let Err(err) = cloned {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(resource = %name, error = %cleanup, "failed to remove staging directory");
                    }
                }
                return Err(err);
            }
        }

        if let Ok(sha) = git::head_sha(name, &dest).await {
            tracing::debug!(resource = %name, sha = %sha, "resource ready");
        }

        Ok(CachedResource {
            name: name.to_string(),
            path: dest,
        })
    }

    /// Delete a git resource's cache directory. Returns whether anything was removed.
    pub async fn remove(&self, name: &str) -> Result<bool, ResourceError> {
        validate_name(name)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let dest = self.path_for(name);
        if !dest.exists() {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&dest)
            .await
            .map_err(|source| io_error(name, "remove cache directory", source))?;
        tracing::info!(resource = %name, "removed cached resource");
        Ok(true)
    }
}

async fn discard(name: &str, dest: &Path) -> Result<(), ResourceError> {
    tokio::fs::remove_dir_all(dest)
        .await
        .map_err(|source| io_error(name, "remove stale cache directory", source))
}

fn io_error(name: &str, operation: &'static str, source: std::io::Error) -> ResourceError {
    ResourceError::Io {
        name: name.to_string(),
        operation,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{commit_file, upstream};

    fn local(name: &str, path: &Path) -> ResourceDefinition {
        ResourceDefinition::Local {
            name: name.to_string(),
            path: path.to_path_buf(),
            notes: String::new(),
        }
    }

    #[tokio::test]
    async fn local_resource_is_used_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(tmp.path().join("resources"));
        let cached = cache.ensure(&local("mine", tmp.path())).await.unwrap();
        assert_eq!(cached.path, tmp.path());
        // nothing is created for local resources
        assert!(!tmp.path().join("resources").exists());
    }

    #[tokio::test]
    async fn missing_local_resource_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(tmp.path().join("resources"));
        let err = cache
            .ensure(&local("mine", &tmp.path().join("absent")))
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::NotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn invalid_definition_fails_before_touching_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let resources = tmp.path().join("resources");
        let cache = ResourceCache::new(&resources);
        let def = ResourceDefinition::Git {
            name: "svelte".into(),
            url: "https://github.com/sveltejs/svelte".into(),
            branch: "-x".into(),
            search_paths: vec![],
            notes: String::new(),
        };
        let err = cache.ensure(&def).await.unwrap_err();
        assert!(matches!(err, ResourceError::Validation(_)));
        assert!(!resources.exists());
    }

    #[tokio::test]
    async fn ensure_twice_is_idempotent() {
        if !git::is_available().await {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (_work, url) = upstream(tmp.path());
        let cache = ResourceCache::new(tmp.path().join("resources"));

        let first = cache.sync_git("up", &url, "main", &[]).await.unwrap();
        let sha1 = git::head_sha("up", &first.path).await.unwrap();
        let readme1 = std::fs::read_to_string(first.path.join("README.md")).unwrap();

        let second = cache.sync_git("up", &url, "main", &[]).await.unwrap();
        let sha2 = git::head_sha("up", &second.path).await.unwrap();
        let readme2 = std::fs::read_to_string(second.path.join("README.md")).unwrap();

        assert_eq!(first.path, second.path);
        assert_eq!(sha1, sha2);
        assert_eq!(readme1, readme2);
    }

    #[tokio::test]
    async fn refresh_discards_local_edits_and_follows_upstream() {
        if !git::is_available().await {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (work, url) = upstream(tmp.path());
        let cache = ResourceCache::new(tmp.path().join("resources"));

        let cached = cache.sync_git("up", &url, "main", &[]).await.unwrap();
        std::fs::write(cached.path.join("README.md"), "scribbled").unwrap();
        std::fs::write(cached.path.join("stray.txt"), "stray").unwrap();
        commit_file(&work, "docs/guide.md", "guide v2\n");

        cache.sync_git("up", &url, "main", &[]).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(cached.path.join("README.md")).unwrap(),
            "# upstream\n"
        );
        assert_eq!(
            std::fs::read_to_string(cached.path.join("docs/guide.md")).unwrap(),
            "guide v2\n"
        );
        assert!(!cached.path.join("stray.txt").exists());
    }

    #[tokio::test]
    async fn changed_url_replaces_the_working_copy() {
        if !git::is_available().await {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (_a, url_a) = upstream(&tmp.path().join("a"));
        let (work_b, url_b) = upstream(&tmp.path().join("b"));
        commit_file(&work_b, "README.md", "# repo B\n");
        let cache = ResourceCache::new(tmp.path().join("resources"));

        let cached = cache.sync_git("up", &url_a, "main", &[]).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(cached.path.join("README.md")).unwrap(),
            "# upstream\n"
        );

        let cached = cache.sync_git("up", &url_b, "main", &[]).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(cached.path.join("README.md")).unwrap(),
            "# repo B\n"
        );
        assert_eq!(git::remote_url("up", &cached.path).await.unwrap(), url_b);
    }

    #[tokio::test]
    async fn failed_clone_leaves_no_directory() {
        if !git::is_available().await {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let resources = tmp.path().join("resources");
        let cache = ResourceCache::new(&resources);
        let missing = format!("file://{}", tmp.path().join("nope").display());

        let err = cache.sync_git("up", &missing, "main", &[]).await.unwrap_err();
        assert!(err.is_retryable());
        let leftovers: Vec<_> = std::fs::read_dir(&resources).unwrap().collect();
        assert!(leftovers.is_empty(), "left behind {:?}", leftovers);
    }

    #[tokio::test]
    async fn directory_without_working_copy_is_recloned() {
        if !git::is_available().await {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (_work, url) = upstream(tmp.path());
        let cache = ResourceCache::new(tmp.path().join("resources"));
        let dest = cache.path_for("up");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("partial"), "junk").unwrap();

        cache.sync_git("up", &url, "main", &[]).await.unwrap();
        assert!(git::is_git_repo(&dest));
        assert!(!dest.join("partial").exists());
    }

    #[tokio::test]
    async fn concurrent_ensures_on_one_name_are_serialized() {
        if !git::is_available().await {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (_work, url) = upstream(tmp.path());
        let cache = Arc::new(ResourceCache::new(tmp.path().join("resources")));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let url = url.clone();
                tokio::spawn(async move { cache.sync_git_locked("up", &url, "main", &[]).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(git::is_git_repo(&cache.path_for("up")));
    }

    #[test]
    fn lock_is_shared_per_name() {
        let cache = ResourceCache::new("/tmp/unused");
        let a = cache.lock_for("svelte");
        let b = cache.lock_for("svelte");
        let c = cache.lock_for("effect");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn remove_deletes_cache_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(tmp.path());
        std::fs::create_dir_all(cache.path_for("svelte")).unwrap();
        assert!(cache.remove("svelte").await.unwrap());
        assert!(!cache.remove("svelte").await.unwrap());
        assert!(cache.remove("../etc").await.is_err());
    }
}
