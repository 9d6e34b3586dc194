use crate::error::{PkgError, Result};
use crate::models::{validate_package_name, AvailablePackage, ARCHIVE_EXTENSION};
use bap_core::{BapConfig, Repository};
use bap_db::PackageDatabase;
use reqwest::Url;

/// Lookups across the cached repository indexes, always in registry order.
pub struct PackageSearch<'a> {
    config: &'a BapConfig,
    repos: &'a [Repository],
}

impl<'a> PackageSearch<'a> {
    pub fn new(config: &'a BapConfig, repos: &'a [Repository]) -> Self {
        Self { config, repos }
    }

    /// First repository in list order whose index contains `name`.
    pub async fn find(&self, name: &str) -> Result<Option<&'a Repository>> {
        for repo in self.repos {
            let Some(mut index) = self.open_index(repo).await? else {
                continue;
            };
            let found = index.contains(name).await;
            index.close().await;
            if found? {
                tracing::debug!("Found {} in repository {}", name, repo.name);
                return Ok(Some(repo));
            }
        }
        Ok(None)
    }

    /// Archive URL of `name` from the first repository listing it.
    pub async fn resolve_download_url(&self, name: &str) -> Result<String> {
        let name = validate_package_name(name)?;
        let repo = self
            .find(name)
            .await?
            .ok_or_else(|| PkgError::PackageNotFound(name.to_string()))?;
        join_url(&repo.url_packages_root, &format!("{}{}", name, ARCHIVE_EXTENSION))
    }

    /// Every package of every cached index, repositories in list order. A
    /// name offered by several repositories appears once per repository.
    pub async fn list_available(&self) -> Result<Vec<AvailablePackage>> {
        let mut available = Vec::new();
        for repo in self.repos {
            let Some(mut index) = self.open_index(repo).await? else {
                continue;
            };
            let listed = index.list_installed().await;
            index.close().await;
            available.extend(listed?.into_iter().map(|info| AvailablePackage {
                repository: repo.name.clone(),
                info,
            }));
        }
        Ok(available)
    }

    async fn open_index(&self, repo: &Repository) -> Result<Option<PackageDatabase>> {
        let path = self.config.repo_index_path(&repo.name);
        if !tokio::fs::try_exists(&path).await? {
            tracing::warn!("Repository {} has no cached index, run sync first", repo.name);
            return Ok(None);
        }
        Ok(Some(PackageDatabase::open_read_only(&path).await?))
    }
}

/// Append `file` as the last path segment of `root`, keeping any query.
fn join_url(root: &str, file: &str) -> Result<String> {
    let invalid = |reason: &str| PkgError::InvalidUrl {
        url: root.to_string(),
        reason: reason.to_string(),
    };
    let mut url = Url::parse(root).map_err(|e| invalid(&e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("cannot be a base"))?
        .pop_if_empty()
        .push(file);
    Ok(url.to_string())
}
