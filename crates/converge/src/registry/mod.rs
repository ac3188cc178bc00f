//! Durable application registry.
//!
//! Applications, their status and the sync history live in SQLite through a
//! thread-safe `Database` handle. Mutations of one application's record are
//! serialized through that application's async lock; different applications
//! never wait on each other beyond the short connection mutex.

use chrono::Utc;
use dashmap::DashMap;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub mod app_repo;
pub mod error;
pub mod history_repo;
pub mod migrations;

pub use error::RegistryError;

use crate::application::{Application, ApplicationSpec, ApplicationStatus, PolicyOverride};
use crate::sync::SyncOperation;
use app_repo::ApplicationRow;

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap. WAL mode is enabled for file databases.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at the given path and runs pending migrations.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        migrations::run_all(&conn)?;

        log::info!("Registry database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&Connection) -> Result<T, RegistryError>,
    {
        let conn = self.conn.lock().map_err(|_| RegistryError::LockPoisoned)?;
        f(&conn)
    }
}

/// Default number of history entries returned.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

pub struct Registry {
    db: Database,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Registry {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: DashMap::new(),
        }
    }

    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// The lock serializing record mutations for `name`.
    pub fn with_app_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn register(&self, name: &str, spec: ApplicationSpec) -> Result<Application, RegistryError> {
        let app = Application::new(name, spec);
        app_repo::insert(&self.db, &ApplicationRow::from_application(&app)?)?;
        log::info!("Registered application {}", name);
        Ok(app)
    }

    pub fn get(&self, name: &str) -> Result<Application, RegistryError> {
        app_repo::find_by_name(&self.db, name)?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?
            .into_application()
    }

    pub fn list(&self) -> Result<Vec<Application>, RegistryError> {
        app_repo::list(&self.db)?
            .into_iter()
            .map(ApplicationRow::into_application)
            .collect()
    }

    /// Replaces the spec, keeping the status.
    pub async fn update_spec(&self, name: &str, spec: ApplicationSpec) -> Result<Application, RegistryError> {
        self.modify(name, |app| app.spec = spec).await
    }

    /// Applies `f` to the status as one read-modify-write under the application's lock.
    pub async fn update_status<F>(&self, name: &str, f: F) -> Result<Application, RegistryError>
    where
        F: FnOnce(&mut ApplicationStatus),
    {
        self.modify(name, |app| f(&mut app.status)).await
    }

    pub async fn set_policy(
        &self,
        name: &str,
        policy: &PolicyOverride,
    ) -> Result<Application, RegistryError> {
        self.modify(name, |app| {
            app.spec.sync_policy = policy.apply_to(&app.spec.sync_policy);
        })
        .await
    }

    /// Removes the record. History is kept for audit.
    pub async fn deregister(&self, name: &str) -> Result<Application, RegistryError> {
        let lock = self.with_app_lock(name);
        let _guard = lock.lock().await;
        let app = self.get(name)?;
        app_repo::delete(&self.db, name)?;
        self.locks.remove(name);
        log::info!("Deregistered application {}", name);
        Ok(app)
    }

    pub fn append_history(&self, operation: &SyncOperation) -> Result<(), RegistryError> {
        history_repo::insert(&self.db, operation)
    }

    /// Most recent sync operations, newest first.
    pub fn history(&self, name: &str, limit: usize) -> Result<Vec<SyncOperation>, RegistryError> {
        history_repo::list_for_application(&self.db, name, limit)
    }

    async fn modify<F>(&self, name: &str, f: F) -> Result<Application, RegistryError>
    where
        F: FnOnce(&mut Application),
    {
        let lock = self.with_app_lock(name);
        let _guard = lock.lock().await;
        let mut app = self.get(name)?;
        f(&mut app);
        app.updated_at = Utc::now();
        app_repo::update(&self.db, &ApplicationRow::from_application(&app)?)?;
        Ok(app)
    }
}
