use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Filesystem layout and network settings for one bap installation.
///
/// Every component takes its paths from this value; nothing is resolved from
/// ambient state after construction.
#[derive(Debug, Clone)]
pub struct BapConfig {
    pub paths: PathsConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub root: PathBuf,
    /// Directory package files are copied into.
    pub install_root: PathBuf,
    /// Downloaded archives.
    pub cache_dir: PathBuf,
    /// Repository list and cached repository indexes.
    pub repo_dir: PathBuf,
    pub database: PathBuf,
    pub repolist: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    pub timeout_secs: u64,
    pub progress_interval_ms: u64,
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            progress_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawPaths {
    root: Option<PathBuf>,
    install_root: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    repo_dir: Option<PathBuf>,
    database: Option<PathBuf>,
    repolist: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    paths: RawPaths,
    download: DownloadConfig,
}

impl BapConfig {
    /// Load configuration from defaults, an optional `bap.toml` and `BAP_*`
    /// environment variables (e.g. `BAP_PATHS__INSTALL_ROOT`).
    pub fn new() -> Result<Self, config::ConfigError> {
        let defaults = DownloadConfig::default();
        let builder = config::Config::builder()
            .set_default("download.timeout_secs", defaults.timeout_secs)?
            .set_default("download.progress_interval_ms", defaults.progress_interval_ms)?
            .add_source(config::File::with_name("bap").required(false))
            .add_source(
                config::Environment::with_prefix("BAP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let raw: RawConfig = builder.build()?.try_deserialize()?;
        Ok(Self::resolve(raw.paths, raw.download))
    }

    /// Default layout under an explicit root directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let paths = RawPaths {
            root: Some(root.into()),
            ..RawPaths::default()
        };
        Self::resolve(paths, DownloadConfig::default())
    }

    fn resolve(raw: RawPaths, download: DownloadConfig) -> Self {
        let root = raw.root.unwrap_or_else(default_root);
        let repo_dir = raw.repo_dir.unwrap_or_else(|| root.join(".baprepos"));
        let paths = PathsConfig {
            install_root: raw.install_root.unwrap_or_else(|| root.clone()),
            cache_dir: raw.cache_dir.unwrap_or_else(|| root.join(".bapcache")),
            database: raw.database.unwrap_or_else(|| root.join("bap.db")),
            repolist: raw.repolist.unwrap_or_else(|| repo_dir.join("repolist")),
            repo_dir,
            root,
        };
        Self { paths, download }
    }

    /// Create every directory of the layout that does not exist yet.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        let p = &self.paths;
        for dir in [&p.install_root, &p.cache_dir, &p.repo_dir] {
            std::fs::create_dir_all(dir)?;
        }
        for file in [&p.database, &p.repolist] {
            if let Some(parent) = file.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Cached index snapshot for a repository.
    pub fn repo_index_path(&self, repo_name: &str) -> PathBuf {
        self.paths.repo_dir.join(format!("{}.db", repo_name))
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .paths
            .database
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "bap.db".into());
        name.push(".lock");
        self.paths
            .database
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(name)
    }
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bap")
}
