//! Sync history repository: the `sync_operations` table.

use chrono::SecondsFormat;
use rusqlite::{params, Row};

use super::app_repo::parse_time;
use super::{Database, RegistryError};
use crate::sync::SyncOperation;

#[derive(Debug, Clone)]
struct OperationRow {
    id: String,
    application: String,
    revision: String,
    trigger_kind: String,
    outcome: Option<String>,
    started_at: String,
    finished_at: Option<String>,
    records: String,
    warnings: String,
    error: Option<String>,
}

impl OperationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            application: row.get("application")?,
            revision: row.get("revision")?,
            trigger_kind: row.get("trigger_kind")?,
            outcome: row.get("outcome")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            records: row.get("records")?,
            warnings: row.get("warnings")?,
            error: row.get("error")?,
        })
    }

    fn into_operation(self) -> Result<SyncOperation, RegistryError> {
        Ok(SyncOperation {
            id: self.id,
            application: self.application,
            revision: self.revision,
            trigger: self
                .trigger_kind
                .parse()
                .map_err(|e: String| RegistryError::serialization("trigger_kind", e))?,
            started_at: parse_time("started_at", &self.started_at)?,
            finished_at: self
                .finished_at
                .as_deref()
                .map(|t| parse_time("finished_at", t))
                .transpose()?,
            outcome: self
                .outcome
                .map(|o| o.parse().map_err(|e: String| RegistryError::serialization("outcome", e)))
                .transpose()?,
            records: serde_json::from_str(&self.records)
                .map_err(|e| RegistryError::serialization("records", e))?,
            warnings: serde_json::from_str(&self.warnings)
                .map_err(|e| RegistryError::serialization("warnings", e))?,
            error: self.error,
        })
    }
}

/// Appends a finished operation.
pub fn insert(db: &Database, op: &SyncOperation) -> Result<(), RegistryError> {
    let records =
        serde_json::to_string(&op.records).map_err(|e| RegistryError::serialization("records", e))?;
    let warnings =
        serde_json::to_string(&op.warnings).map_err(|e| RegistryError::serialization("warnings", e))?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO sync_operations (id, application, revision, trigger_kind, outcome,
             started_at, finished_at, records, warnings, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                op.id,
                op.application,
                op.revision,
                op.trigger.to_string(),
                op.outcome.map(|o| o.to_string()),
                op.started_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                op.finished_at
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
                records,
                warnings,
                op.error,
            ],
        )?;
        Ok(())
    })
}

/// Most recent operations for an application, newest first.
pub fn list_for_application(
    db: &Database,
    application: &str,
    limit: usize,
) -> Result<Vec<SyncOperation>, RegistryError> {
    let rows = db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM sync_operations WHERE application = ?1
             ORDER BY started_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![application, limit as i64], OperationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;
    rows.into_iter().map(OperationRow::into_operation).collect()
}

pub fn count_for_application(db: &Database, application: &str) -> Result<u64, RegistryError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_operations WHERE application = ?1",
            params![application],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffOp;
    use crate::manifest::ResourceKey;
    use crate::sync::{RecordResult, RecordStatus, SyncOutcome, SyncTrigger};

    #[test]
    fn test_insert_and_list_newest_first() {
        let db = Database::open_in_memory().unwrap();
        for (i, revision) in ["r1", "r2", "r3"].iter().enumerate() {
            let mut op = SyncOperation::start("shop", revision, SyncTrigger::NewRevision);
            op.started_at += chrono::Duration::seconds(i as i64);
            op.records.push(RecordResult {
                key: ResourceKey::new("Deployment", Some("prod"), "web"),
                op: DiffOp::Update,
                status: RecordStatus::Succeeded,
                attempts: 1,
                message: None,
            });
            op.warnings.push("left ConfigMap/prod/extra in place".into());
            op.finish(false);
            insert(&db, &op).unwrap();
        }
        insert(&db, &SyncOperation::start("billing", "x", SyncTrigger::Manual)).unwrap();

        let history = list_for_application(&db, "shop", 2).unwrap();
        let revisions: Vec<&str> = history.iter().map(|o| o.revision.as_str()).collect();
        assert_eq!(revisions, vec!["r3", "r2"]);
        assert_eq!(history[0].outcome, Some(SyncOutcome::Succeeded));
        assert_eq!(history[0].records.len(), 1);
        assert_eq!(history[0].warnings.len(), 1);
        assert_eq!(count_for_application(&db, "shop").unwrap(), 3);
        assert_eq!(count_for_application(&db, "billing").unwrap(), 1);
    }
}
