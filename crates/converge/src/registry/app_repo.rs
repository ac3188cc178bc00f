//! Application repository: CRUD for the `applications` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, Row};
use std::collections::BTreeMap;

use super::{Database, RegistryError};
use crate::application::{Application, ApplicationSpec, ApplicationStatus};
use crate::manifest::ResourceKey;

/// A raw application row.
#[derive(Debug, Clone)]
pub struct ApplicationRow {
    pub name: String,
    pub spec: String,
    pub last_synced_revision: Option<String>,
    pub last_attempted_revision: Option<String>,
    pub last_outcome: Option<String>,
    pub health: String,
    pub health_message: Option<String>,
    pub phase: String,
    pub last_sync_time: Option<String>,
    pub last_error: Option<String>,
    pub self_heal_attempts: u32,
    pub alert: Option<String>,
    pub last_applied: String,
    pub desired_keys: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ApplicationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            name: row.get("name")?,
            spec: row.get("spec")?,
            last_synced_revision: row.get("last_synced_revision")?,
            last_attempted_revision: row.get("last_attempted_revision")?,
            last_outcome: row.get("last_outcome")?,
            health: row.get("health")?,
            health_message: row.get("health_message")?,
            phase: row.get("phase")?,
            last_sync_time: row.get("last_sync_time")?,
            last_error: row.get("last_error")?,
            self_heal_attempts: row.get("self_heal_attempts")?,
            alert: row.get("alert")?,
            last_applied: row.get("last_applied")?,
            desired_keys: row.get("desired_keys")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn from_application(app: &Application) -> Result<Self, RegistryError> {
        let status = &app.status;
        Ok(Self {
            name: app.name.clone(),
            spec: serde_json::to_string(&app.spec)
                .map_err(|e| RegistryError::serialization("spec", e))?,
            last_synced_revision: status.last_synced_revision.clone(),
            last_attempted_revision: status.last_attempted_revision.clone(),
            last_outcome: status.last_outcome.map(|o| o.to_string()),
            health: status.health.to_string(),
            health_message: status.health_message.clone(),
            phase: status.phase.to_string(),
            last_sync_time: status.last_sync_time.map(|t| t.to_rfc3339()),
            last_error: status.last_error.clone(),
            self_heal_attempts: status.self_heal_attempts,
            alert: status.alert.clone(),
            last_applied: serde_json::to_string(&status.last_applied)
                .map_err(|e| RegistryError::serialization("last_applied", e))?,
            desired_keys: serde_json::to_string(&status.desired)
                .map_err(|e| RegistryError::serialization("desired_keys", e))?,
            created_at: app.created_at.to_rfc3339(),
            updated_at: app.updated_at.to_rfc3339(),
        })
    }

    pub fn into_application(self) -> Result<Application, RegistryError> {
        let spec: ApplicationSpec =
            serde_json::from_str(&self.spec).map_err(|e| RegistryError::serialization("spec", e))?;
        let last_applied: BTreeMap<ResourceKey, String> = serde_json::from_str(&self.last_applied)
            .map_err(|e| RegistryError::serialization("last_applied", e))?;
        let desired: Vec<ResourceKey> = serde_json::from_str(&self.desired_keys)
            .map_err(|e| RegistryError::serialization("desired_keys", e))?;

        let status = ApplicationStatus {
            last_synced_revision: self.last_synced_revision,
            last_attempted_revision: self.last_attempted_revision,
            last_outcome: self
                .last_outcome
                .map(|o| o.parse().map_err(|e: String| RegistryError::serialization("last_outcome", e)))
                .transpose()?,
            health: self
                .health
                .parse()
                .map_err(|e: String| RegistryError::serialization("health", e))?,
            health_message: self.health_message,
            phase: self
                .phase
                .parse()
                .map_err(|e: String| RegistryError::serialization("phase", e))?,
            last_sync_time: self
                .last_sync_time
                .as_deref()
                .map(|t| parse_time("last_sync_time", t))
                .transpose()?,
            last_error: self.last_error,
            self_heal_attempts: self.self_heal_attempts,
            alert: self.alert,
            last_applied,
            desired,
        };

        Ok(Application {
            name: self.name,
            spec,
            status,
            created_at: parse_time("created_at", &self.created_at)?,
            updated_at: parse_time("updated_at", &self.updated_at)?,
        })
    }
}

pub(crate) fn parse_time(column: &str, value: &str) -> Result<DateTime<Utc>, RegistryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RegistryError::serialization(column, e))
}

/// Inserts a new application row. Fails with `AlreadyExists` on a duplicate name.
pub fn insert(db: &Database, app: &ApplicationRow) -> Result<(), RegistryError> {
    db.with_conn(|conn| {
        let result = conn.execute(
            "INSERT INTO applications (name, spec, last_synced_revision, last_attempted_revision,
             last_outcome, health, health_message, phase, last_sync_time, last_error,
             self_heal_attempts, alert, last_applied, desired_keys, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                app.name,
                app.spec,
                app.last_synced_revision,
                app.last_attempted_revision,
                app.last_outcome,
                app.health,
                app.health_message,
                app.phase,
                app.last_sync_time,
                app.last_error,
                app.self_heal_attempts,
                app.alert,
                app.last_applied,
                app.desired_keys,
                app.created_at,
                app.updated_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(RegistryError::AlreadyExists(app.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    })
}

/// Overwrites every column except `name` and `created_at`.
pub fn update(db: &Database, app: &ApplicationRow) -> Result<(), RegistryError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE applications SET spec=?2, last_synced_revision=?3, last_attempted_revision=?4,
             last_outcome=?5, health=?6, health_message=?7, phase=?8, last_sync_time=?9,
             last_error=?10, self_heal_attempts=?11, alert=?12, last_applied=?13,
             desired_keys=?14, updated_at=?15
             WHERE name=?1",
            params![
                app.name,
                app.spec,
                app.last_synced_revision,
                app.last_attempted_revision,
                app.last_outcome,
                app.health,
                app.health_message,
                app.phase,
                app.last_sync_time,
                app.last_error,
                app.self_heal_attempts,
                app.alert,
                app.last_applied,
                app.desired_keys,
                app.updated_at,
            ],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound(app.name.clone()));
        }
        Ok(())
    })
}

pub fn find_by_name(db: &Database, name: &str) -> Result<Option<ApplicationRow>, RegistryError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM applications WHERE name = ?1")?;
        let mut rows = stmt.query_map(params![name], ApplicationRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(RegistryError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// All applications, ordered by name.
pub fn list(db: &Database) -> Result<Vec<ApplicationRow>, RegistryError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM applications ORDER BY name")?;
        let rows = stmt
            .query_map([], ApplicationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes an application row. Returns false if it did not exist.
pub fn delete(db: &Database, name: &str) -> Result<bool, RegistryError> {
    db.with_conn(|conn| {
        let deleted = conn.execute("DELETE FROM applications WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    })
}
