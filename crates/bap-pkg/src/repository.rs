use crate::error::{PkgError, Result};
use bap_core::Repository;
use reqwest::Url;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const REPOLIST_TEMPLATE: &str = "\
# bap repositories list
#
# <name> <url_repo_database> <url_packages_root>
";

/// The ordered list of configured repositories.
///
/// List order is significant: search takes the first repository that has a
/// package.
pub struct RepositoryRegistry {
    path: PathBuf,
}

impl RepositoryRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the commented template if the list does not exist. Never adds
    /// entries.
    pub async fn ensure_exists(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, REPOLIST_TEMPLATE).await?;
        tracing::info!("Created empty repository list at {:?}", self.path);
        Ok(())
    }

    pub async fn load(&self) -> Result<Vec<Repository>> {
        self.ensure_exists().await?;
        let text = tokio::fs::read_to_string(&self.path).await?;
        let repos = parse_repolist(&text)?;
        tracing::debug!("Loaded {} repositories from {:?}", repos.len(), self.path);
        Ok(repos)
    }
}

/// Parse repository list text: `#` starts a comment anywhere on a line, and
/// each remaining non-blank line holds a name and two absolute URLs.
pub fn parse_repolist(text: &str) -> Result<Vec<Repository>> {
    let mut repos = Vec::new();
    let mut names = HashSet::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let malformed = |reason: String| PkgError::MalformedRepoList {
            line: idx + 1,
            reason,
        };

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [name, url_repo_database, url_packages_root] = tokens[..] else {
            return Err(malformed(format!("expected 3 fields, found {}", tokens.len())));
        };
        for url in [url_repo_database, url_packages_root] {
            if let Err(e) = Url::parse(url) {
                return Err(malformed(format!("invalid URL {:?}: {}", url, e)));
            }
        }
        if !names.insert(name.to_string()) {
            return Err(malformed(format!("duplicate repository name {:?}", name)));
        }
        repos.push(Repository {
            name: name.to_string(),
            url_repo_database: url_repo_database.to_string(),
            url_packages_root: url_packages_root.to_string(),
        });
    }
    Ok(repos)
}
