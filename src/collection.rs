//! Collection assembly.
//!
//! A collection is a directory of symbolic links, one per resource, that
//! gives the agent a single working directory spanning several cached
//! repositories. Its key is derived from the resource names alone, so the
//! same set of names always maps to the same directory and a second request
//! reuses what the first one built.

use futures_util::future::try_join_all;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::ResourceCache;
use crate::config::Config;
use crate::error::{CollectionError, ResourceError, ValidationError};
use crate::models::{Collection, ResourceDefinition};
use crate::validate::validate_name;

/// Looks up resource definitions by name.
pub trait ResourceResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<ResourceDefinition>;
}

impl ResourceResolver for Config {
    fn resolve(&self, name: &str) -> Option<ResourceDefinition> {
        self.resource(name).cloned()
    }
}

/// Deduplicated, sorted resource names joined with `+`.
pub fn collection_key<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    resource_names(names).join("+")
}

/// Resource names sorted and deduplicated, in key order.
pub fn resource_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
    names.sort();
    names.dedup();
    names
}

/// Longest key that still fits in a single file name on common filesystems.
pub const MAX_KEY_BYTES: usize = 255;

pub struct CollectionAssembler {
    cache: Arc<ResourceCache>,
    collections_dir: PathBuf,
    resolver: Arc<dyn ResourceResolver>,
}

impl CollectionAssembler {
    pub fn new(
        cache: Arc<ResourceCache>,
        collections_dir: impl Into<PathBuf>,
        resolver: Arc<dyn ResourceResolver>,
    ) -> Self {
        Self {
            cache,
            collections_dir: collections_dir.into(),
            resolver,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(ResourceCache::new(&config.storage.resources_dir)),
            &config.storage.collections_dir,
            Arc::new(config.clone()),
        )
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn resolver(&self) -> &Arc<dyn ResourceResolver> {
        &self.resolver
    }

    /// Ensure every named resource is cached and link them into one directory.
    pub async fn ensure<I, S>(&self, names: I) -> Result<Collection, CollectionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = resource_names(names);
        if names.is_empty() {
            return Err(CollectionError::Empty);
        }

        let key = names.join("+");
        if key.len() > MAX_KEY_BYTES {
            return Err(ValidationError::new(
                "resources",
                format!(
                    "collection key is {} bytes, the limit is {}; ask about fewer resources at once",
                    key.len(),
                    MAX_KEY_BYTES
                ),
            )
            .into());
        }

        let mut defs = Vec::with_capacity(names.len());
        for name in &names {
            validate_name(name).map_err(ResourceError::from)?;
            let def = self
                .resolver
                .resolve(name)
                .ok_or_else(|| ResourceError::NotConfigured(name.clone()))?;
            defs.push(def);
        }

        let cached = try_join_all(defs.iter().map(|def| self.cache.ensure(def))).await?;

        let path = self.collections_dir.join(&key);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| CollectionError::Io {
                path: path.clone(),
                source,
            })?;

        let mut linked = 0usize;
        for resource in &cached {
            let link = path.join(&resource.name);
            if tokio::fs::symlink_metadata(&link).await.is_ok() {
                continue;
            }
            let target = tokio::fs::canonicalize(&resource.path)
                .await
                .map_err(|source| CollectionError::Io {
                    path: resource.path.clone(),
                    source,
                })?;
            match create_link(&target, &link).await {
                Ok(()) => linked += 1,
                // a concurrent ensure of the same key got there first
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(CollectionError::Io { path: link, source }),
            }
        }

        if linked > 0 {
            tracing::info!(key = %key, path = %path.display(), linked, "collection materialized");
        } else {
            tracing::debug!(key = %key, "collection already materialized");
        }

        let notes = defs
            .iter()
            .filter(|def| !def.notes().trim().is_empty())
            .map(|def| format!("{}: {}", def.name(), def.notes().trim()))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(Collection {
            key,
            path,
            resources: names,
            notes,
        })
    }
}

#[cfg(unix)]
async fn create_link(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn create_link(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}
