//! Structured difference between desired and live state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::manifest::{ResourceDeclaration, ResourceKey};
use crate::runtime::ResourceObservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffOp {
    Create,
    Update,
    Delete,
    NoOp,
}

impl std::fmt::Display for DiffOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiffOp::Create => "Create",
            DiffOp::Update => "Update",
            DiffOp::Delete => "Delete",
            DiffOp::NoOp => "NoOp",
        };
        f.write_str(s)
    }
}

/// One changed field of an Update, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Dotted path, with `[i]` for array elements.
    pub path: String,
    pub desired: Option<Value>,
    pub live: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRecord {
    pub key: ResourceKey,
    pub op: DiffOp,
    pub weight: u8,
    /// Fingerprint of the desired declaration, when there is one.
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FieldChange>,
    /// The live side was Unknown; the record re-applies without comparing.
    #[serde(default)]
    pub unknown_live: bool,
    #[serde(skip)]
    pub desired: Option<ResourceDeclaration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffReport {
    pub records: Vec<DiffRecord>,
    /// Live objects in scope that this application does not own and does not declare.
    pub out_of_scope: Vec<ResourceKey>,
}

impl DiffReport {
    /// Records that require an action.
    pub fn pending(&self) -> impl Iterator<Item = &DiffRecord> {
        self.records.iter().filter(|r| r.op != DiffOp::NoOp)
    }

    pub fn is_converged(&self) -> bool {
        self.pending().next().is_none()
    }

    pub fn count(&self, op: DiffOp) -> usize {
        self.records.iter().filter(|r| r.op == op).count()
    }
}

/// Computes the records needed to move `live` to `desired` for `application`.
///
/// Only live objects carrying this application's ownership marker can become
/// Delete records. Unknown observations are never deleted or compared.
pub fn diff(
    desired: &[ResourceDeclaration],
    live: &[ResourceObservation],
    application: &str,
) -> DiffReport {
    let live_by_key: BTreeMap<&ResourceKey, &ResourceObservation> =
        live.iter().map(|o| (&o.key, o)).collect();
    let desired_keys: BTreeSet<ResourceKey> = desired.iter().map(|d| d.key()).collect();

    let mut applies = Vec::new();
    let mut noops = Vec::new();
    for decl in desired {
        let key = decl.key();
        let fingerprint = decl.fingerprint();
        let mut record = DiffRecord {
            key: key.clone(),
            op: DiffOp::Create,
            weight: decl.weight(),
            fingerprint: Some(fingerprint.clone()),
            changes: Vec::new(),
            unknown_live: false,
            desired: Some(decl.clone()),
        };

        match live_by_key.get(&key) {
            None => applies.push(record),
            Some(obs) if obs.is_unknown() => {
                record.op = DiffOp::Update;
                record.unknown_live = true;
                applies.push(record);
            }
            Some(obs) if obs.fingerprint == fingerprint => {
                record.op = DiffOp::NoOp;
                noops.push(record);
            }
            Some(obs) => {
                record.op = DiffOp::Update;
                record.changes = field_changes(&decl.normalized(), &obs.object.normalized());
                applies.push(record);
            }
        }
    }

    let mut deletes = Vec::new();
    let mut out_of_scope = Vec::new();
    for obs in live {
        if desired_keys.contains(&obs.key) || obs.is_unknown() {
            continue;
        }
        if obs.managed_by.is_owned_by(application) {
            deletes.push(DiffRecord {
                key: obs.key.clone(),
                op: DiffOp::Delete,
                weight: obs.object.weight(),
                fingerprint: None,
                changes: Vec::new(),
                unknown_live: false,
                desired: None,
            });
        } else {
            out_of_scope.push(obs.key.clone());
        }
    }

    applies.sort_by(|a, b| (a.weight, &a.key).cmp(&(b.weight, &b.key)));
    deletes.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.key.cmp(&b.key)));
    noops.sort_by(|a, b| a.key.cmp(&b.key));
    out_of_scope.sort();

    let mut records = applies;
    records.extend(deletes);
    records.extend(noops);
    DiffReport {
        records,
        out_of_scope,
    }
}

/// Lists the leaf fields that differ between two values.
pub fn field_changes(desired: &Value, live: &Value) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    collect_changes("", Some(desired), Some(live), &mut changes);
    changes
}

fn collect_changes(path: &str, desired: Option<&Value>, live: Option<&Value>, out: &mut Vec<FieldChange>) {
    match (desired, live) {
        (Some(Value::Object(d)), Some(Value::Object(l))) => {
            let keys: BTreeSet<&String> = d.keys().chain(l.keys()).collect();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                collect_changes(&child, d.get(key), l.get(key), out);
            }
        }
        (Some(Value::Array(d)), Some(Value::Array(l))) if d.len() == l.len() => {
            for (i, (dv, lv)) in d.iter().zip(l.iter()).enumerate() {
                collect_changes(&format!("{}[{}]", path, i), Some(dv), Some(lv), out);
            }
        }
        (d, l) if d != l => out.push(FieldChange {
            path: path.to_string(),
            desired: d.cloned(),
            live: l.cloned(),
        }),
        _ => {}
    }
}
