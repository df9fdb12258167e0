use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::{Collection, Record, StoreEngine, StoreError};
use crate::id::new_uuid_v7;
use crate::time::{now_iso, parse_iso};

pub const DEFAULT_USER_NAME: &str = "Utente";

/// A person whose data is partitioned in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(rename = "nome", alias = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
    #[serde(
        rename = "colore",
        alias = "accentColor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub accent_color: Option<String>,
    /// Fields written by other versions are carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl User {
    pub fn new(display_name: &str, accent_color: Option<String>) -> Self {
        Self {
            id: new_uuid_v7(),
            display_name: display_name.trim().to_string(),
            created_at: now_iso(),
            accent_color,
            extra: Map::new(),
        }
    }

    pub fn to_record(&self) -> Result<Record, StoreError> {
        Record::from_value(Collection::Users, serde_json::to_value(self)?)
    }

    pub fn from_record(record: &Record) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(record.to_value())?)
    }
}

/// Decode user records, oldest first (ties broken by id).
pub fn users_from_records(records: &[Record]) -> Result<Vec<User>, StoreError> {
    let mut users = records
        .iter()
        .map(User::from_record)
        .collect::<Result<Vec<_>, _>>()?;
    users.sort_by(|a, b| {
        parse_iso(&a.created_at)
            .cmp(&parse_iso(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(users)
}

/// All users, oldest first.
pub async fn list_users(engine: &StoreEngine) -> Result<Vec<User>, StoreError> {
    users_from_records(&engine.get_all(Collection::Users).await?)
}

pub async fn find_user(engine: &StoreEngine, id: &str) -> Result<Option<User>, StoreError> {
    engine
        .get(Collection::Users, id)
        .await?
        .as_ref()
        .map(User::from_record)
        .transpose()
}

pub async fn oldest_user(engine: &StoreEngine) -> Result<Option<User>, StoreError> {
    Ok(list_users(engine).await?.into_iter().next())
}

pub async fn save_user(engine: &StoreEngine, user: &User) -> Result<(), StoreError> {
    engine.put(Collection::Users, &user.to_record()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_uses_nome_and_created_at() {
        let user = User {
            id: "u1".into(),
            display_name: "Anna".into(),
            created_at: "2024-01-02T03:04:05.000Z".into(),
            accent_color: None,
            extra: Map::new(),
        };
        assert_eq!(
            serde_json::to_value(&user).expect("serialize"),
            json!({ "id": "u1", "nome": "Anna", "createdAt": "2024-01-02T03:04:05.000Z" })
        );
    }

    #[test]
    fn accepts_display_name_alias_and_keeps_extras() {
        let user: User = serde_json::from_value(json!({
            "id": "u1",
            "displayName": "Bruno",
            "createdAt": "2024-01-02T03:04:05Z",
            "accentColor": "#ff8800",
            "avatar": "b.png"
        }))
        .expect("deserialize");
        assert_eq!(user.display_name, "Bruno");
        assert_eq!(user.accent_color.as_deref(), Some("#ff8800"));
        assert_eq!(user.extra.get("avatar"), Some(&json!("b.png")));
    }

    #[tokio::test]
    async fn list_is_ordered_by_creation() {
        let engine = StoreEngine::in_memory();
        engine.open().await.expect("open");
        for (id, created) in [
            ("late", "2025-05-01T00:00:00Z"),
            ("early", "2023-05-01T00:00:00Z"),
        ] {
            let user: User = serde_json::from_value(json!({
                "id": id, "nome": id, "createdAt": created
            }))
            .expect("user");
            save_user(&engine, &user).await.expect("save");
        }
        let ids: Vec<_> = list_users(&engine)
            .await
            .expect("list")
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert_eq!(
            oldest_user(&engine).await.expect("oldest").map(|u| u.id),
            Some("early".to_string())
        );
    }
}
