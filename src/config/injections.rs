//! Operator and user defined patch tables
//!
//! Each table maps a Pod label key to one `add /metadata/annotations` patch. A
//! Pod opts into an entry by carrying that label with the value `true`.

use std::collections::BTreeMap;

use json_patch::PatchOperation;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

/// The only patch target accepted in a table
pub const ANNOTATIONS_PATH: &str = "/metadata/annotations";

/// Nested key of the control ConfigMap document holding the user table
pub const USER_INJECTIONS_KEY: &str = "user-defined-injections";

/// Label key to patch operation, iterated in key order
pub type PatchTable = BTreeMap<String, PatchOperation>;

/// Which of the two tables an update targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectionSource {
    /// `nri-user-defined-injections`, one patch document per ConfigMap key
    Operator,
    /// `user-defined-injections` object inside the control ConfigMap document
    User,
}

impl std::fmt::Display for InjectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operator => write!(f, "operator"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Why a single table entry was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InjectionError {
    /// Not a JSON patch operation
    #[error("failed to decode injection: {0}")]
    Decode(String),

    /// Anything other than `add`
    #[error("operation {0} is not supported, only add can be customized")]
    UnsupportedOperation(String),

    /// Anything other than `/metadata/annotations`
    #[error("path {0} is not supported, only /metadata/annotations can be customized")]
    UnsupportedPath(String),

    /// The value must be an annotation map
    #[error("value of an annotations patch must be a JSON object")]
    NotAnObject,
}

/// Parse one patch document from its string form
pub fn parse_injection(document: &str) -> Result<PatchOperation, InjectionError> {
    let value: Value =
        serde_json::from_str(document).map_err(|e| InjectionError::Decode(e.to_string()))?;
    parse_injection_value(value)
}

/// Validate one patch document already decoded as JSON
pub fn parse_injection_value(value: Value) -> Result<PatchOperation, InjectionError> {
    let op: PatchOperation =
        serde_json::from_value(value).map_err(|e| InjectionError::Decode(e.to_string()))?;

    let PatchOperation::Add(add) = &op else {
        return Err(InjectionError::UnsupportedOperation(op_name(&op).to_string()));
    };
    if add.path.as_str() != ANNOTATIONS_PATH {
        return Err(InjectionError::UnsupportedPath(add.path.to_string()));
    }
    if !add.value.is_object() {
        return Err(InjectionError::NotAnObject);
    }
    Ok(op)
}

fn op_name(op: &PatchOperation) -> &'static str {
    match op {
        PatchOperation::Add(_) => "add",
        PatchOperation::Remove(_) => "remove",
        PatchOperation::Replace(_) => "replace",
        PatchOperation::Move(_) => "move",
        PatchOperation::Copy(_) => "copy",
        PatchOperation::Test(_) => "test",
    }
}

/// Structural equality on op, path and value.
///
/// `serde_json::Value` objects compare without regard to key order.
pub fn same_injection(a: &PatchOperation, b: &PatchOperation) -> bool {
    match (a, b) {
        (PatchOperation::Add(a), PatchOperation::Add(b)) => a.path == b.path && a.value == b.value,
        _ => false,
    }
}

/// Build the next table from the current one and freshly parsed entries.
///
/// Entries that parsed are taken as-is. An entry that failed keeps its current
/// value, or stays absent. Keys missing from `entries` are evicted.
pub fn merge_table<I>(source: InjectionSource, current: &PatchTable, entries: I) -> PatchTable
where
    I: IntoIterator<Item = (String, Result<PatchOperation, InjectionError>)>,
{
    let mut next = PatchTable::new();

    for (key, parsed) in entries {
        match parsed {
            Ok(op) => {
                match current.get(&key) {
                    Some(existing) if same_injection(existing, &op) => {}
                    Some(_) => info!(%source, key = %key, "Updating injection"),
                    None => info!(%source, key = %key, "Adding injection"),
                }
                next.insert(key, op);
            }
            Err(e) => {
                error!(%source, key = %key, error = %e, "Ignoring invalid injection");
                if let Some(existing) = current.get(&key) {
                    next.insert(key, existing.clone());
                }
            }
        }
    }

    for key in current.keys().filter(|k| !next.contains_key(*k)) {
        info!(%source, key = %key, "Removing stale injection");
    }

    next
}

/// Operator table update from the `nri-user-defined-injections` ConfigMap data
pub fn operator_table_from(current: &PatchTable, data: &BTreeMap<String, String>) -> PatchTable {
    merge_table(
        InjectionSource::Operator,
        current,
        data.iter()
            .map(|(k, doc)| (k.clone(), parse_injection(doc))),
    )
}

/// User table update from the control ConfigMap data.
///
/// Returns `None` when the document is malformed and the current table must be
/// kept. A missing main key or missing nested object clears the table.
pub fn user_table_from(
    current: &PatchTable,
    data: &BTreeMap<String, String>,
) -> Option<PatchTable> {
    let Some(document) = data.get(crate::CONFIGMAP_MAIN_FILE_KEY) else {
        return Some(PatchTable::new());
    };

    let root: serde_json::Map<String, Value> = match serde_json::from_str(document) {
        Ok(root) => root,
        Err(e) => {
            error!(error = %e, "Failed to decode control ConfigMap, keeping user injections");
            return None;
        }
    };

    let entries = match root.get(USER_INJECTIONS_KEY) {
        None => return Some(PatchTable::new()),
        Some(Value::Object(entries)) => entries,
        Some(_) => {
            error!(
                key = USER_INJECTIONS_KEY,
                "User injections are not a JSON object, keeping user injections"
            );
            return None;
        }
    };

    Some(merge_table(
        InjectionSource::User,
        current,
        entries
            .iter()
            .map(|(k, v)| (k.clone(), parse_injection_value(v.clone()))),
    ))
}

/// Patches whose key is a Pod label with value `true`, ignoring case
pub fn select_for_labels(
    table: &PatchTable,
    labels: Option<&BTreeMap<String, String>>,
) -> Vec<PatchOperation> {
    let Some(labels) = labels else {
        return Vec::new();
    };
    table
        .iter()
        .filter(|(key, _)| {
            labels
                .get(*key)
                .is_some_and(|value| value.to_lowercase() == "true")
        })
        .map(|(_, op)| op.clone())
        .collect()
}

/// First string value for `key` supplied by an annotations patch
pub fn annotation_from_patches<'a>(patches: &'a [PatchOperation], key: &str) -> Option<&'a str> {
    patches.iter().find_map(|op| match op {
        PatchOperation::Add(add) if add.path.as_str() == ANNOTATIONS_PATH => {
            add.value.get(key).and_then(Value::as_str)
        }
        _ => None,
    })
}
