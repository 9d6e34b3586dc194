use crate::download;
use crate::error::{PkgError, Result};
use crate::lock::InstallLock;
use bap_core::{BapConfig, Repository};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-repository outcome of a sync. One repository failing does not stop
/// the others.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced: Vec<String>,
    pub failed: Vec<(String, PkgError)>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Downloads each repository's index into the local repository directory.
pub struct RepositorySync {
    client: reqwest::Client,
    config: BapConfig,
}

impl RepositorySync {
    pub fn new(client: reqwest::Client, config: BapConfig) -> Self {
        Self { client, config }
    }

    /// Refresh every index in list order. A failed download keeps the
    /// previous snapshot of that repository.
    pub async fn sync(&self, repos: &[Repository], cancel: &CancellationToken) -> Result<SyncReport> {
        let _lock = InstallLock::acquire(&self.config.lock_path())?;
        let mut report = SyncReport::default();

        for repo in repos {
            if cancel.is_cancelled() {
                report.failed.push((repo.name.clone(), PkgError::Cancelled(repo.url_repo_database.clone())));
                continue;
            }
            let dest = self.config.repo_index_path(&repo.name);
            tracing::info!("Syncing repository {} from {}", repo.name, repo.url_repo_database);
            match download::fetch(&self.client, &repo.url_repo_database, &dest, None, Duration::ZERO, cancel).await {
                Ok(bytes) => {
                    tracing::info!("Synced {} ({} bytes)", repo.name, bytes);
                    report.synced.push(repo.name.clone());
                }
                Err(e) => {
                    tracing::error!("Failed to sync repository {}: {}", repo.name, e);
                    report.failed.push((repo.name.clone(), e));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::routing::get;
    use axum::Router;

    #[tokio::test]
    async fn test_sync_collects_failures_and_continues() {
        let base = serve(
            Router::new()
                .route("/one.db", get(|| async { "first index" }))
                .route("/three.db", get(|| async { "third index" })),
        )
        .await;

        let tmp = tempfile::tempdir().unwrap();
        let config = BapConfig::with_root(tmp.path());
        config.ensure_dirs().unwrap();
        std::fs::write(config.repo_index_path("two"), "stale snapshot").unwrap();

        let repo = |name: &str| Repository {
            name: name.to_string(),
            url_repo_database: format!("{}/{}.db", base, name),
            url_packages_root: format!("{}/pkgs", base),
        };
        let repos = vec![repo("one"), repo("two"), repo("three")];

        let sync = RepositorySync::new(download::http_client(&config).unwrap(), config.clone());
        let report = sync.sync(&repos, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.synced, vec!["one", "three"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "two");
        assert!(matches!(report.failed[0].1, PkgError::DownloadFailed { .. }));
        assert!(!report.is_complete());

        assert_eq!(std::fs::read_to_string(config.repo_index_path("one")).unwrap(), "first index");
        assert_eq!(std::fs::read_to_string(config.repo_index_path("two")).unwrap(), "stale snapshot");
    }

    #[tokio::test]
    async fn test_cancelled_sync_keeps_snapshots() {
        let base = serve(Router::new().route("/one.db", get(|| async { "fresh index" }))).await;
        let tmp = tempfile::tempdir().unwrap();
        let config = BapConfig::with_root(tmp.path());
        config.ensure_dirs().unwrap();
        std::fs::write(config.repo_index_path("one"), "old snapshot").unwrap();

        let repos = vec![Repository {
            name: "one".to_string(),
            url_repo_database: format!("{}/one.db", base),
            url_packages_root: format!("{}/pkgs", base),
        }];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let sync = RepositorySync::new(download::http_client(&config).unwrap(), config.clone());
        let report = sync.sync(&repos, &cancel).await.unwrap();

        assert!(report.synced.is_empty());
        assert!(matches!(report.failed[..], [(ref name, PkgError::Cancelled(_))] if name == "one"));
        assert_eq!(std::fs::read_to_string(config.repo_index_path("one")).unwrap(), "old snapshot");
    }
}
