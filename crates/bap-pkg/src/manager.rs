use crate::download::Downloader;
use crate::error::Result;
use crate::installer::Installer;
use crate::models::{AvailablePackage, UninstallReport};
use crate::repository::RepositoryRegistry;
use crate::search::PackageSearch;
use crate::sync::{RepositorySync, SyncReport};
use bap_core::{BapConfig, PkgInfo, Repository};
use bap_db::PackageDatabase;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Entry point for front-ends: one installation root, its database and its
/// repositories.
pub struct PackageManager {
    config: BapConfig,
    db: PackageDatabase,
    installer: Installer,
    registry: RepositoryRegistry,
    downloader: Downloader,
}

impl PackageManager {
    pub async fn open(config: BapConfig) -> Result<Self> {
        config.ensure_dirs()?;
        let db = PackageDatabase::open(&config.paths.database).await?;
        let registry = RepositoryRegistry::new(config.paths.repolist.clone());
        registry.ensure_exists().await?;

        Ok(Self {
            installer: Installer::new(&config),
            downloader: Downloader::new(&config)?,
            registry,
            db,
            config,
        })
    }

    pub fn config(&self) -> &BapConfig {
        &self.config
    }

    pub async fn install(&mut self, archive: &Path) -> Result<PkgInfo> {
        self.installer.install(&mut self.db, archive).await
    }

    pub async fn uninstall(&mut self, name: &str) -> Result<UninstallReport> {
        self.installer.uninstall(&mut self.db, name).await
    }

    pub async fn upgrade(&mut self, archive: &Path) -> Result<PkgInfo> {
        self.installer.upgrade(&mut self.db, archive).await
    }

    pub async fn query(&mut self, name: &str, with_files: bool) -> Result<PkgInfo> {
        Ok(self.db.query(name, with_files).await?)
    }

    pub async fn list_installed(&mut self) -> Result<Vec<PkgInfo>> {
        Ok(self.db.list_installed().await?)
    }

    pub async fn repositories(&self) -> Result<Vec<Repository>> {
        self.registry.load().await
    }

    pub async fn sync(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let repos = self.repositories().await?;
        RepositorySync::new(self.downloader.client().clone(), self.config.clone())
            .sync(&repos, cancel)
            .await
    }

    pub async fn list_available(&self) -> Result<Vec<AvailablePackage>> {
        let repos = self.repositories().await?;
        PackageSearch::new(&self.config, &repos).list_available().await
    }

    pub async fn resolve_download_url(&self, name: &str) -> Result<String> {
        let repos = self.repositories().await?;
        PackageSearch::new(&self.config, &repos)
            .resolve_download_url(name)
            .await
    }

    /// Resolve and download a package archive into the cache.
    pub async fn download(
        &self,
        name: &str,
        progress: Option<mpsc::Sender<u8>>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let url = self.resolve_download_url(name).await?;
        self.downloader.download(name, &url, progress, cancel).await
    }

    /// Download a package and install it, or upgrade it in place when
    /// `upgrade` is set and it is already installed.
    pub async fn get(
        &mut self,
        name: &str,
        upgrade: bool,
        progress: Option<mpsc::Sender<u8>>,
        cancel: &CancellationToken,
    ) -> Result<PkgInfo> {
        let archive = self.download(name, progress, cancel).await?;
        if upgrade && self.db.contains(name).await? {
            self.upgrade(&archive).await
        } else {
            self.install(&archive).await
        }
    }

    pub fn cached_archive(&self, name: &str) -> Result<PathBuf> {
        self.downloader.archive_path(name)
    }

    pub async fn close(self) {
        self.db.close().await;
    }
}

/// Build an archive off the async runtime.
pub async fn pack(source_dir: &Path, definition: &Path, output: &Path) -> Result<PkgInfo> {
    let (source_dir, definition, output) = (source_dir.to_path_buf(), definition.to_path_buf(), output.to_path_buf());
    tokio::task::spawn_blocking(move || crate::archive::pack(&source_dir, &definition, &output))
        .await
        .map_err(std::io::Error::other)?
}
