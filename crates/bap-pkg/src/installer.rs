use crate::archive::{self, UnpackedPackage};
use crate::error::{PkgError, Result};
use crate::lock::InstallLock;
use crate::models::UninstallReport;
use bap_core::{BapConfig, PkgInfo};
use bap_db::{DbError, PackageDatabase};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Applies archives to the installation root and keeps the database in step
/// with what is on disk.
pub struct Installer {
    install_root: PathBuf,
    lock_path: PathBuf,
}

impl Installer {
    pub fn new(config: &BapConfig) -> Self {
        Self {
            install_root: config.paths.install_root.clone(),
            lock_path: config.lock_path(),
        }
    }

    /// Install an archive.
    ///
    /// Name uniqueness and file conflicts are checked before anything is
    /// copied. If recording the package fails afterwards, the files copied by
    /// this call are removed again.
    pub async fn install(&self, db: &mut PackageDatabase, archive: &Path) -> Result<PkgInfo> {
        let _lock = InstallLock::acquire(&self.lock_path)?;
        let unpacked = unpack_blocking(archive).await?;
        self.install_unpacked(db, &unpacked).await
    }

    /// Remove an installed package and its files. Owned files that are already
    /// missing or cannot be removed are reported in the result and logged,
    /// never fatal; the record is removed either way.
    pub async fn uninstall(&self, db: &mut PackageDatabase, name: &str) -> Result<UninstallReport> {
        let _lock = InstallLock::acquire(&self.lock_path)?;
        self.uninstall_locked(db, name).await
    }

    /// Replace the installed package named in the archive with the archive's
    /// contents, or install it if absent.
    pub async fn upgrade(&self, db: &mut PackageDatabase, archive: &Path) -> Result<PkgInfo> {
        let _lock = InstallLock::acquire(&self.lock_path)?;
        let unpacked = unpack_blocking(archive).await?;
        let name = unpacked.info.name.clone();

        let old = match db.query(&name, true).await {
            Ok(old) => Some(old),
            Err(DbError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(old) = old {
            // Paths the old version owns are about to be freed.
            let owned: HashSet<&str> = old
                .files
                .iter()
                .flatten()
                .map(String::as_str)
                .collect();
            self.scan_conflicts(unpacked.files(), &owned)?;
            log_version_change(&old, &unpacked.info);
            self.uninstall_locked(db, &name).await?;
        }

        self.install_unpacked(db, &unpacked).await
    }

    async fn install_unpacked(&self, db: &mut PackageDatabase, unpacked: &UnpackedPackage) -> Result<PkgInfo> {
        let info = &unpacked.info;
        tracing::info!("Installing {}", info);

        if db.contains(&info.name).await? {
            return Err(DbError::PackageAlreadyExists(info.name.clone()).into());
        }
        self.scan_conflicts(unpacked.files(), &HashSet::new())?;

        let copied = self.copy_files(unpacked).await?;

        let recorded = match db.add(info).await {
            Ok(()) => db.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            tracing::error!("Failed to record {}: {}, removing copied files", info, e);
            if let Err(rb) = db.rollback().await {
                tracing::warn!("Rollback of {} failed: {}", info, rb);
            }
            remove_all(&copied).await;
            return Err(e.into());
        }

        tracing::info!("Installed {} ({} files)", info, copied.len());
        Ok(info.clone())
    }

    async fn uninstall_locked(&self, db: &mut PackageDatabase, name: &str) -> Result<UninstallReport> {
        let info = db.query(name, true).await?;
        tracing::info!("Uninstalling {}", info);

        let mut report = UninstallReport {
            package: info.name.clone(),
            ..UninstallReport::default()
        };
        for file in info.files.iter().flatten() {
            let path = self.install_root.join(file);
            match fs::remove_file(&path).await {
                Ok(()) => report.removed.push(path),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::warn!("File not found while uninstalling {}: {:?}", name, path);
                    report.missing.push(path);
                }
                Err(e) => {
                    tracing::warn!("Could not remove {:?} while uninstalling {}: {}", path, name, e);
                    report.unremovable.push(path);
                }
            }
        }

        db.remove(name).await?;
        db.commit().await?;
        tracing::info!(
            "Uninstalled {} ({} removed, {} missing, {} left in place)",
            info,
            report.removed.len(),
            report.missing.len(),
            report.unremovable.len()
        );
        Ok(report)
    }

    /// Fail on the first payload path that already exists under the root, or
    /// whose parent exists as something other than a directory. Paths in
    /// `freed` are ignored.
    fn scan_conflicts(&self, files: &[String], freed: &HashSet<&str>) -> Result<()> {
        for file in files {
            if freed.contains(file.as_str()) {
                continue;
            }
            let rel = Path::new(file);
            if self.install_root.join(rel).symlink_metadata().is_ok() {
                return Err(PkgError::FileConflict(rel.to_path_buf()));
            }
            for ancestor in rel.ancestors().skip(1).filter(|a| !a.as_os_str().is_empty()) {
                if let Ok(meta) = self.install_root.join(ancestor).metadata() {
                    if !meta.is_dir() {
                        return Err(PkgError::FileConflict(ancestor.to_path_buf()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy the payload onto the root. On failure nothing copied so far is
    /// left behind.
    async fn copy_files(&self, unpacked: &UnpackedPackage) -> Result<Vec<PathBuf>> {
        let mut copied = Vec::with_capacity(unpacked.files().len());
        for file in unpacked.files() {
            let src = unpacked.path().join(file);
            let dst = self.install_root.join(file);
            let result = async {
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::copy(&src, &dst).await
            }
            .await;
            match result {
                Ok(_) => copied.push(dst),
                Err(e) => {
                    tracing::error!("Failed to copy {:?} to {:?}: {}", src, dst, e);
                    remove_all(&copied).await;
                    return Err(e.into());
                }
            }
        }
        Ok(copied)
    }
}

async fn unpack_blocking(archive: &Path) -> Result<UnpackedPackage> {
    let archive = archive.to_path_buf();
    tokio::task::spawn_blocking(move || archive::unpack(&archive))
        .await
        .map_err(std::io::Error::other)?
}

async fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path).await {
            tracing::warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

fn log_version_change(old: &PkgInfo, new: &PkgInfo) {
    match (old.version.to_semver(), new.version.to_semver()) {
        (Some(a), Some(b)) if b < a => {
            tracing::warn!("Downgrading {} from {} to {}", new.name, old.version, new.version)
        }
        (Some(a), Some(b)) if b == a => tracing::info!("Reinstalling {}", new),
        _ => tracing::info!("Upgrading {} from {} to {}", new.name, old.version, new.version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFINITION_FILE;
    use std::fs as stdfs;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        config: BapConfig,
        work: PathBuf,
        db: PackageDatabase,
        installer: Installer,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let config = BapConfig::with_root(tmp.path().join("root"));
        config.ensure_dirs().unwrap();
        let work = tmp.path().join("work");
        stdfs::create_dir_all(&work).unwrap();
        let db = PackageDatabase::open(&config.paths.database).await.unwrap();
        let installer = Installer::new(&config);
        Fixture {
            _tmp: tmp,
            config,
            work,
            db,
            installer,
        }
    }

    /// Pack an archive named `<name>-<version>.bap` with the given payload.
    fn make_archive(work: &Path, name: &str, version: &str, files: &[(&str, &str)]) -> PathBuf {
        let src = work.join(format!("{}-{}-src", name, version));
        for (path, content) in files {
            let path = src.join(path);
            stdfs::create_dir_all(path.parent().unwrap()).unwrap();
            stdfs::write(path, content).unwrap();
        }
        let definition = src.join(DEFINITION_FILE);
        stdfs::write(
            &definition,
            format!(
                "name = {}\nversion = {}\ndesc = test package\ndepends =\nauthor = T <t@example.com>\nmaintainer = T <t@example.com>\n",
                name, version
            ),
        )
        .unwrap();
        let out = work.join(format!("{}-{}.bap", name, version));
        archive::pack(&src, &definition, &out).unwrap();
        out
    }

    fn files_on_disk(root: &Path) -> Vec<String> {
        archive::collect_files(root)
            .unwrap()
            .into_iter()
            .filter(|f| !f.starts_with(".bap") && !f.starts_with("bap.db"))
            .collect()
    }

    #[tokio::test]
    async fn test_install_records_exactly_the_copied_files() {
        let mut f = fixture().await;
        let archive = make_archive(&f.work, "turrets", "1.0.0", &[("mods/turrets.py", "t"), ("data/t.png", "png")]);

        let info = f.installer.install(&mut f.db, &archive).await.unwrap();
        assert_eq!(info.name, "turrets");

        let recorded = f.db.query("turrets", true).await.unwrap().files.unwrap();
        assert_eq!(recorded, vec!["data/t.png", "mods/turrets.py"]);
        assert_eq!(files_on_disk(&f.config.paths.install_root), recorded);
    }

    #[tokio::test]
    async fn test_install_conflict_changes_nothing() {
        let mut f = fixture().await;
        let root = f.config.paths.install_root.clone();
        stdfs::create_dir_all(root.join("mods")).unwrap();
        stdfs::write(root.join("mods/shared.py"), "user file").unwrap();

        let archive = make_archive(&f.work, "clash", "1.0.0", &[("aaa.py", "a"), ("mods/shared.py", "pkg")]);
        let err = f.installer.install(&mut f.db, &archive).await.unwrap_err();

        assert!(matches!(err, PkgError::FileConflict(ref p) if p == Path::new("mods/shared.py")));
        assert!(!root.join("aaa.py").exists());
        assert_eq!(stdfs::read_to_string(root.join("mods/shared.py")).unwrap(), "user file");
        assert!(!f.db.contains("clash").await.unwrap());
    }

    #[tokio::test]
    async fn test_install_conflict_with_file_in_place_of_directory() {
        let mut f = fixture().await;
        stdfs::write(f.config.paths.install_root.join("mods"), "not a dir").unwrap();
        let archive = make_archive(&f.work, "nested", "1.0.0", &[("mods/a.py", "a")]);
        let err = f.installer.install(&mut f.db, &archive).await.unwrap_err();
        assert!(matches!(err, PkgError::FileConflict(ref p) if p == Path::new("mods")));
    }

    #[tokio::test]
    async fn test_duplicate_install_rejected_before_copy() {
        let mut f = fixture().await;
        let first = make_archive(&f.work, "dup", "1.0.0", &[("dup.py", "1")]);
        let second = make_archive(&f.work, "dup", "2.0.0", &[("dup2.py", "2")]);

        f.installer.install(&mut f.db, &first).await.unwrap();
        let err = f.installer.install(&mut f.db, &second).await.unwrap_err();

        assert!(matches!(err, PkgError::Db(DbError::PackageAlreadyExists(ref n)) if n == "dup"));
        assert!(!f.config.paths.install_root.join("dup2.py").exists());
    }

    #[tokio::test]
    async fn test_failed_registration_removes_copied_files() {
        let mut f = fixture().await;
        let root = f.config.paths.install_root.clone();
        let a = make_archive(&f.work, "a", "1.0.0", &[("shared.py", "a")]);
        f.installer.install(&mut f.db, &a).await.unwrap();

        // The file vanishes from disk but stays owned by `a` in the database.
        stdfs::remove_file(root.join("shared.py")).unwrap();

        let b = make_archive(&f.work, "b", "1.0.0", &[("b.py", "b"), ("shared.py", "b")]);
        let err = f.installer.install(&mut f.db, &b).await.unwrap_err();

        assert!(matches!(err, PkgError::Db(DbError::FileOwned { .. })));
        assert!(!root.join("b.py").exists());
        assert!(!root.join("shared.py").exists());
        assert!(!f.db.contains("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_uninstall_removes_files_and_record() {
        let mut f = fixture().await;
        let root = f.config.paths.install_root.clone();
        let archive = make_archive(&f.work, "skins", "1.0.0", &[("mods/skins/a.py", "a"), ("mods/skins/b.py", "b")]);
        f.installer.install(&mut f.db, &archive).await.unwrap();

        let report = f.installer.uninstall(&mut f.db, "skins").await.unwrap();
        assert_eq!(report.removed.len(), 2);
        assert!(report.missing.is_empty());
        assert!(files_on_disk(&root).is_empty());
        assert!(matches!(f.db.query("skins", false).await, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_uninstall_tolerates_missing_files() {
        let mut f = fixture().await;
        let root = f.config.paths.install_root.clone();
        let archive = make_archive(&f.work, "gone", "1.0.0", &[("g1.py", "1"), ("g2.py", "2"), ("g3.py", "3")]);
        f.installer.install(&mut f.db, &archive).await.unwrap();
        stdfs::remove_file(root.join("g1.py")).unwrap();
        stdfs::remove_file(root.join("g3.py")).unwrap();

        let report = f.installer.uninstall(&mut f.db, "gone").await.unwrap();
        assert_eq!(report.missing, vec![root.join("g1.py"), root.join("g3.py")]);
        assert_eq!(report.removed, vec![root.join("g2.py")]);
        assert!(!f.db.contains("gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_uninstall_continues_past_unremovable_path() {
        let mut f = fixture().await;
        let root = f.config.paths.install_root.clone();
        let archive = make_archive(&f.work, "swap", "1.0.0", &[("s1.py", "1"), ("s2.py", "2")]);
        f.installer.install(&mut f.db, &archive).await.unwrap();

        // A directory now sits where an owned file used to be.
        stdfs::remove_file(root.join("s1.py")).unwrap();
        stdfs::create_dir_all(root.join("s1.py/inner")).unwrap();

        let report = f.installer.uninstall(&mut f.db, "swap").await.unwrap();
        assert_eq!(report.unremovable, vec![root.join("s1.py")]);
        assert_eq!(report.removed, vec![root.join("s2.py")]);
        assert!(root.join("s1.py").is_dir());
        assert!(!f.db.contains("swap").await.unwrap());
    }

    #[tokio::test]
    async fn test_uninstall_unknown_package() {
        let mut f = fixture().await;
        let err = f.installer.uninstall(&mut f.db, "nope").await.unwrap_err();
        assert!(matches!(err, PkgError::Db(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_upgrade_replaces_files() {
        let mut f = fixture().await;
        let root = f.config.paths.install_root.clone();
        let v1 = make_archive(&f.work, "mod", "1.0.0", &[("mod/core.py", "v1"), ("mod/old.py", "old")]);
        let v2 = make_archive(&f.work, "mod", "1.1.0", &[("mod/core.py", "v2"), ("mod/new.py", "new")]);

        f.installer.install(&mut f.db, &v1).await.unwrap();
        let info = f.installer.upgrade(&mut f.db, &v2).await.unwrap();

        assert_eq!(info.version.to_string(), "1.1.0");
        assert_eq!(stdfs::read_to_string(root.join("mod/core.py")).unwrap(), "v2");
        assert!(!root.join("mod/old.py").exists());
        let pkg = f.db.query("mod", true).await.unwrap();
        assert_eq!(pkg.version.to_string(), "1.1.0");
        assert_eq!(pkg.files.unwrap(), vec!["mod/core.py", "mod/new.py"]);
    }

    #[tokio::test]
    async fn test_upgrade_to_same_archive_reinstalls() {
        let mut f = fixture().await;
        let archive = make_archive(&f.work, "same", "1.0.0", &[("same.py", "s")]);
        f.installer.install(&mut f.db, &archive).await.unwrap();
        f.installer.upgrade(&mut f.db, &archive).await.unwrap();
        assert_eq!(f.db.query("same", true).await.unwrap().files.unwrap(), vec!["same.py"]);
        assert!(f.config.paths.install_root.join("same.py").exists());
    }

    #[tokio::test]
    async fn test_upgrade_conflict_keeps_old_version() {
        let mut f = fixture().await;
        let root = f.config.paths.install_root.clone();
        let v1 = make_archive(&f.work, "keep", "1.0.0", &[("keep.py", "v1")]);
        f.installer.install(&mut f.db, &v1).await.unwrap();
        stdfs::write(root.join("foreign.py"), "user").unwrap();

        let v2 = make_archive(&f.work, "keep", "2.0.0", &[("keep.py", "v2"), ("foreign.py", "pkg")]);
        let err = f.installer.upgrade(&mut f.db, &v2).await.unwrap_err();

        assert!(matches!(err, PkgError::FileConflict(_)));
        assert_eq!(stdfs::read_to_string(root.join("keep.py")).unwrap(), "v1");
        assert_eq!(f.db.query("keep", false).await.unwrap().version.to_string(), "1.0.0");
    }

    #[tokio::test]
    async fn test_concurrent_operation_is_locked_out() {
        let mut f = fixture().await;
        let archive = make_archive(&f.work, "locked", "1.0.0", &[("l.py", "l")]);
        let _held = InstallLock::acquire(&f.config.lock_path()).unwrap();

        let err = f.installer.install(&mut f.db, &archive).await.unwrap_err();
        assert!(matches!(err, PkgError::Locked(_)));
        assert!(!f.config.paths.install_root.join("l.py").exists());
    }
}
