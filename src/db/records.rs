use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use super::StoreError;

pub const ID_FIELD: &str = "id";
pub const USER_FIELD: &str = "userId";
/// Id of the configuration record written before users existed.
pub const LEGACY_CONFIG_ID: &str = "default";
const CONFIG_ID_PREFIX: &str = "config_";

/// The fixed set of collections the store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    Config,
    Clients,
    Invoices,
    WorkLogs,
    Deadlines,
    Users,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Config,
        Collection::Clients,
        Collection::Invoices,
        Collection::WorkLogs,
        Collection::Deadlines,
        Collection::Users,
    ];

    /// Collections whose records carry an owning `userId`.
    pub const PARTITIONED: [Collection; 5] = [
        Collection::Config,
        Collection::Clients,
        Collection::Invoices,
        Collection::WorkLogs,
        Collection::Deadlines,
    ];

    /// Per-user data collections replaced wholesale by a backup import.
    pub const USER_DATA: [Collection; 4] = [
        Collection::Clients,
        Collection::Invoices,
        Collection::WorkLogs,
        Collection::Deadlines,
    ];

    /// Name used in snapshot files.
    pub fn name(self) -> &'static str {
        match self {
            Collection::Config => "config",
            Collection::Clients => "clienti",
            Collection::Invoices => "fatture",
            Collection::WorkLogs => "workLogs",
            Collection::Deadlines => "scadenze",
            Collection::Users => "users",
        }
    }

    /// Backing SQLite table.
    pub(crate) fn table(self) -> &'static str {
        match self {
            Collection::Config => "config",
            Collection::Clients => "clienti",
            Collection::Invoices => "fatture",
            Collection::WorkLogs => "work_logs",
            Collection::Deadlines => "scadenze",
            Collection::Users => "users",
        }
    }

    pub fn is_partitioned(self) -> bool {
        !matches!(self, Collection::Users)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.name() == s || c.table() == s)
            .ok_or_else(|| format!("unknown collection: {s}"))
    }
}

/// Derived id of a user's configuration record.
pub fn config_id_for(user_id: &str) -> String {
    format!("{CONFIG_ID_PREFIX}{user_id}")
}

/// Owner encoded in a derived config id.
pub fn config_owner(id: &str) -> Option<&str> {
    id.strip_prefix(CONFIG_ID_PREFIX).filter(|owner| !owner.is_empty())
}

/// A JSON object stored in a collection.
///
/// Only `id` and `userId` are interpreted; the remaining fields belong to the
/// callers and are stored verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    /// Validate `value` as a record of `collection`.
    pub fn from_value(collection: Collection, value: Value) -> Result<Self, StoreError> {
        let invalid = |reason: String| StoreError::InvalidRecord {
            collection: collection.name(),
            reason,
        };

        let fields = match value {
            Value::Object(map) => map,
            other => return Err(invalid(format!("expected an object, got {}", kind(&other)))),
        };

        match fields.get(ID_FIELD) {
            Some(Value::String(id)) if !id.trim().is_empty() => {}
            Some(Value::String(_)) => return Err(invalid("id must not be empty".into())),
            Some(other) => return Err(invalid(format!("id must be a string, got {}", kind(other)))),
            None => return Err(invalid("missing id".into())),
        }

        match fields.get(USER_FIELD) {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(other) => {
                return Err(invalid(format!(
                    "userId must be a string, got {}",
                    kind(other)
                )))
            }
        }

        let record = Record { fields };
        if collection == Collection::Config {
            if let Some(user_id) = record.user_id() {
                let id = record.id();
                if id != LEGACY_CONFIG_ID && id != config_id_for(user_id) {
                    return Err(invalid(format!(
                        "config id {id} does not match owner {user_id}"
                    )));
                }
            }
        }
        Ok(record)
    }

    pub fn id(&self) -> &str {
        self.fields
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Owning user, or `None` for records written before users existed.
    pub fn user_id(&self) -> Option<&str> {
        self.fields
            .get(USER_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn set_user_id(&mut self, user_id: &str) {
        self.fields
            .insert(USER_FIELD.to_string(), Value::String(user_id.to_string()));
    }

    pub fn set_id(&mut self, id: &str) {
        self.fields
            .insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collection_names_round_trip() {
        for collection in Collection::ALL {
            assert_eq!(collection.name().parse::<Collection>(), Ok(collection));
        }
        assert_eq!("work_logs".parse::<Collection>(), Ok(Collection::WorkLogs));
        assert!("fornitori".parse::<Collection>().is_err());
        assert!(!Collection::Users.is_partitioned());
    }

    #[test]
    fn accepts_unstamped_record() {
        let record =
            Record::from_value(Collection::Clients, json!({ "id": "c1", "nome": "ACME" }))
                .expect("valid");
        assert_eq!(record.id(), "c1");
        assert_eq!(record.user_id(), None);
    }

    #[test]
    fn null_user_id_counts_as_unstamped() {
        let record =
            Record::from_value(Collection::Invoices, json!({ "id": "f1", "userId": null }))
                .expect("valid");
        assert_eq!(record.user_id(), None);
    }

    #[test]
    fn rejects_bad_shapes() {
        for value in [
            json!([1, 2]),
            json!({ "nome": "no id" }),
            json!({ "id": 4 }),
            json!({ "id": "  " }),
            json!({ "id": "x", "userId": 12 }),
        ] {
            let err = Record::from_value(Collection::Clients, value).expect_err("invalid");
            assert!(matches!(
                err,
                StoreError::InvalidRecord {
                    collection: "clienti",
                    ..
                }
            ));
        }
    }

    #[test]
    fn config_ids_must_match_owner() {
        assert!(Record::from_value(
            Collection::Config,
            json!({ "id": "config_u1", "userId": "u1" })
        )
        .is_ok());
        assert!(Record::from_value(Collection::Config, json!({ "id": "default" })).is_ok());
        assert!(Record::from_value(
            Collection::Config,
            json!({ "id": "config_u2", "userId": "u1" })
        )
        .is_err());
    }

    #[test]
    fn stamping_preserves_other_fields() {
        let mut record = Record::from_value(
            Collection::WorkLogs,
            json!({ "id": "w1", "ore": 3.5, "note": "audit" }),
        )
        .expect("valid");
        record.set_user_id("u1");
        assert_eq!(
            record.into_value(),
            json!({ "id": "w1", "ore": 3.5, "note": "audit", "userId": "u1" })
        );
    }
}
