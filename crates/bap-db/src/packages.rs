use bap_core::{BapError, PkgInfo, Version};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Connection, Row, Sqlite, Transaction};
use std::path::{Path, PathBuf};

const CREATE_PACKAGES: &str = r#"CREATE TABLE IF NOT EXISTS packages (
    name TEXT PRIMARY KEY,
    "desc" TEXT NOT NULL,
    version TEXT NOT NULL
)"#;

const CREATE_FILES: &str = r#"CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    package TEXT NOT NULL REFERENCES packages (name)
)"#;

#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("Package not found: {0}")]
    NotFound(String),
    #[error("Package already exists: {0}")]
    PackageAlreadyExists(String),
    #[error("File {path} is already owned by package {owner}")]
    FileOwned { path: String, owner: String },
    #[error("Package {0} carries no file list")]
    FilesRequired(String),
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Model(#[from] BapError),
}

pub type DbResult<T> = Result<T, DbError>;

/// Registry of packages and the paths each one owns.
///
/// Mutations accumulate in a pending transaction and only become durable on
/// [`commit`](Self::commit). Dropping the database with mutations pending rolls
/// them back. Reads issued while a transaction is pending observe its writes.
pub struct PackageDatabase {
    pool: SqlitePool,
    path: PathBuf,
    pending: Option<Transaction<'static, Sqlite>>,
}

impl PackageDatabase {
    /// Open (creating if needed) a writable database and initialise its schema.
    ///
    /// The rollback journal is used so the database stays a single
    /// self-contained file; repository indexes are published that way.
    pub async fn open(path: &Path) -> DbResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .foreign_keys(true);
        let db = Self::connect(path, options).await?;

        let mut conn = db.pool.acquire().await?;
        sqlx::query(CREATE_PACKAGES).execute(&mut *conn).await?;
        sqlx::query(CREATE_FILES).execute(&mut *conn).await?;
        drop(conn);

        tracing::debug!("Opened package database at {:?}", path);
        Ok(db)
    }

    /// Open an existing database without modifying it, e.g. a cached
    /// repository index.
    pub async fn open_read_only(path: &Path) -> DbResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false);
        Self::connect(path, options).await
    }

    async fn connect(path: &Path, options: SqliteConnectOptions) -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
            pending: None,
        })
    }

    /// Look up one package. With `with_files` the owned paths are attached in
    /// insertion order; otherwise `files` is `None`.
    pub async fn query(&mut self, name: &str, with_files: bool) -> DbResult<PkgInfo> {
        match self.pending.as_mut() {
            Some(tx) => fetch_package(tx, name, with_files).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                fetch_package(&mut conn, name, with_files).await
            }
        }
    }

    pub async fn contains(&mut self, name: &str) -> DbResult<bool> {
        match self.query(name, false).await {
            Ok(_) => Ok(true),
            Err(DbError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every package row in storage order, without file detail.
    pub async fn list_installed(&mut self) -> DbResult<Vec<PkgInfo>> {
        match self.pending.as_mut() {
            Some(tx) => fetch_all_packages(tx).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                fetch_all_packages(&mut conn).await
            }
        }
    }

    /// Name of the package owning `path`, if any.
    pub async fn owner_of(&mut self, path: &str) -> DbResult<Option<String>> {
        match self.pending.as_mut() {
            Some(tx) => fetch_owner(tx, path).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                fetch_owner(&mut conn, path).await
            }
        }
    }

    /// Record a package and its owned files. Either all rows are added or none.
    pub async fn add(&mut self, pkg: &PkgInfo) -> DbResult<()> {
        let files = pkg
            .files
            .as_ref()
            .ok_or_else(|| DbError::FilesRequired(pkg.name.clone()))?;

        let tx = self.begin_pending().await?;
        let mut savepoint = Connection::begin(&mut **tx).await?;

        if package_exists(&mut savepoint, &pkg.name).await? {
            return Err(DbError::PackageAlreadyExists(pkg.name.clone()));
        }

        sqlx::query(r#"INSERT INTO packages (name, "desc", version) VALUES (?, ?, ?)"#)
            .bind(&pkg.name)
            .bind(&pkg.desc)
            .bind(pkg.version.to_string())
            .execute(&mut *savepoint)
            .await?;

        for file in files {
            if let Some(owner) = fetch_owner(&mut savepoint, file).await? {
                return Err(DbError::FileOwned {
                    path: file.clone(),
                    owner,
                });
            }
            sqlx::query("INSERT INTO files (path, package) VALUES (?, ?)")
                .bind(file)
                .bind(&pkg.name)
                .execute(&mut *savepoint)
                .await?;
        }

        savepoint.commit().await?;
        tracing::debug!("Staged {} with {} files", pkg, files.len());
        Ok(())
    }

    /// Delete a package row and its file rows. Removing an absent name is a
    /// no-op.
    pub async fn remove(&mut self, name: &str) -> DbResult<()> {
        let tx = self.begin_pending().await?;
        sqlx::query("DELETE FROM files WHERE package = ?")
            .bind(name)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM packages WHERE name = ?")
            .bind(name)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Make pending mutations durable.
    pub async fn commit(&mut self) -> DbResult<()> {
        if let Some(tx) = self.pending.take() {
            tx.commit().await?;
            tracing::debug!("Committed {:?}", self.path);
        }
        Ok(())
    }

    /// Discard pending mutations.
    pub async fn rollback(&mut self) -> DbResult<()> {
        if let Some(tx) = self.pending.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    pub async fn close(mut self) {
        // Pending work is dropped, which rolls it back.
        self.pending.take();
        self.pool.close().await;
    }

    async fn begin_pending(&mut self) -> DbResult<&mut Transaction<'static, Sqlite>> {
        let tx = match self.pending.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        Ok(self.pending.insert(tx))
    }
}

async fn package_exists(conn: &mut SqliteConnection, name: &str) -> DbResult<bool> {
    let row = sqlx::query("SELECT 1 FROM packages WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

async fn fetch_owner(conn: &mut SqliteConnection, path: &str) -> DbResult<Option<String>> {
    let row = sqlx::query("SELECT package FROM files WHERE path = ?")
        .bind(path)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(match row {
        Some(row) => Some(row.try_get("package")?),
        None => None,
    })
}

async fn fetch_package(
    conn: &mut SqliteConnection,
    name: &str,
    with_files: bool,
) -> DbResult<PkgInfo> {
    let row = sqlx::query(r#"SELECT name, version, "desc" FROM packages WHERE name = ?"#)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DbError::NotFound(name.to_string()))?;
    let mut pkg = row_to_pkginfo(&row)?;

    if with_files {
        let files = sqlx::query("SELECT path FROM files WHERE package = ? ORDER BY rowid")
            .bind(name)
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(|r| r.try_get::<String, _>("path"))
            .collect::<Result<Vec<_>, _>>()?;
        pkg.files = Some(files);
    }
    Ok(pkg)
}

async fn fetch_all_packages(conn: &mut SqliteConnection) -> DbResult<Vec<PkgInfo>> {
    let rows = sqlx::query(r#"SELECT name, version, "desc" FROM packages"#)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(row_to_pkginfo).collect()
}

fn row_to_pkginfo(row: &sqlx::sqlite::SqliteRow) -> DbResult<PkgInfo> {
    let name: String = row.try_get("name")?;
    let version: String = row.try_get("version")?;
    let desc: String = row.try_get("desc")?;
    let version: Version = version.parse()?;
    Ok(PkgInfo::new(name, version, desc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, files: &[&str]) -> PkgInfo {
        PkgInfo::new(name, Version::new(1, 0, 0), format!("{} package", name))
            .with_files(files.iter().map(|f| f.to_string()).collect())
    }

    async fn open_temp() -> (tempfile::TempDir, PackageDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let db = PackageDatabase::open(&dir.path().join("bap.db")).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_add_query_with_files() {
        let (_dir, mut db) = open_temp().await;
        db.add(&sample("turrets", &["mods/turrets.py", "data/turret.png"]))
            .await
            .unwrap();
        db.commit().await.unwrap();

        let pkg = db.query("turrets", false).await.unwrap();
        assert_eq!(pkg.version, Version::new(1, 0, 0));
        assert_eq!(pkg.files, None);

        let pkg = db.query("turrets", true).await.unwrap();
        assert_eq!(
            pkg.files,
            Some(vec!["mods/turrets.py".to_string(), "data/turret.png".to_string()])
        );
    }

    #[tokio::test]
    async fn test_query_missing_is_not_found() {
        let (_dir, mut db) = open_temp().await;
        assert!(matches!(db.query("ghost", true).await, Err(DbError::NotFound(n)) if n == "ghost"));
        assert!(!db.contains("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_requires_files() {
        let (_dir, mut db) = open_temp().await;
        let pkg = PkgInfo::new("bare", Version::new(0, 1, 0), "");
        assert!(matches!(db.add(&pkg).await, Err(DbError::FilesRequired(_))));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_without_partial_rows() {
        let (_dir, mut db) = open_temp().await;
        db.add(&sample("a", &["a.py"])).await.unwrap();
        db.commit().await.unwrap();

        let err = db.add(&sample("a", &["other.py"])).await.unwrap_err();
        assert!(matches!(err, DbError::PackageAlreadyExists(n) if n == "a"));
        db.commit().await.unwrap();
        assert_eq!(db.owner_of("other.py").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_path_owned_once() {
        let (_dir, mut db) = open_temp().await;
        db.add(&sample("a", &["shared.py"])).await.unwrap();
        let err = db.add(&sample("b", &["b.py", "shared.py"])).await.unwrap_err();
        assert!(matches!(err, DbError::FileOwned { ref owner, .. } if owner == "a"));
        db.commit().await.unwrap();

        // The failed add left nothing behind.
        assert!(!db.contains("b").await.unwrap());
        assert_eq!(db.owner_of("b.py").await.unwrap(), None);
        assert_eq!(db.owner_of("shared.py").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bap.db");
        {
            let mut db = PackageDatabase::open(&path).await.unwrap();
            db.add(&sample("volatile", &["v.py"])).await.unwrap();
            assert!(db.contains("volatile").await.unwrap());
            db.close().await;
        }
        let mut db = PackageDatabase::open(&path).await.unwrap();
        assert!(!db.contains("volatile").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let (_dir, mut db) = open_temp().await;
        db.add(&sample("a", &["a.py"])).await.unwrap();
        db.add(&sample("b", &["b.py"])).await.unwrap();
        db.commit().await.unwrap();

        db.remove("a").await.unwrap();
        db.remove("never-installed").await.unwrap();
        db.commit().await.unwrap();

        let names: Vec<String> = db
            .list_installed()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["b".to_string()]);
        assert_eq!(db.owner_of("a.py").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_only_open_sees_committed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let mut db = PackageDatabase::open(&path).await.unwrap();
        db.add(&sample("listed", &[])).await.unwrap();
        db.commit().await.unwrap();
        db.close().await;

        let mut index = PackageDatabase::open_read_only(&path).await.unwrap();
        assert!(index.contains("listed").await.unwrap());
        assert!(index.add(&sample("new", &[])).await.is_err());
    }

    #[tokio::test]
    async fn test_read_only_open_of_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PackageDatabase::open_read_only(&dir.path().join("absent.db")).await.is_err());
    }
}
