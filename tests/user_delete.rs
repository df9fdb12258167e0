use std::time::Duration;

use anyhow::Result;
use libretto_lib::db::Collection;
use libretto_lib::user_active::{StoreHandle, ACTIVE_USER_KEY};
use libretto_lib::{ChangeFeed, PartitionError, UserPartition};
use serde_json::json;
#[path = "util.rs"]
mod util;

#[tokio::test]
async fn last_user_cannot_be_deleted() -> Result<()> {
    let partition = util::ready_partition().await?;
    let only = partition.active_id().expect("active user");
    partition
        .ledger()
        .clients
        .save(json!({ "id": "c1", "nome": "ACME" }))
        .await?;
    let before = partition.engine().export_all().await?;

    let err = partition
        .delete_user(&only)
        .await
        .expect_err("deleting the last user must fail");
    assert!(matches!(err, PartitionError::LastUser));

    assert_eq!(partition.engine().export_all().await?, before);
    assert_eq!(partition.active_id(), Some(only));
    Ok(())
}

#[tokio::test]
async fn deleting_the_active_user_switches_to_the_oldest_remaining() -> Result<()> {
    let partition = util::ready_partition().await?;
    let first = partition.active_id().expect("active user");
    // Distinct creation timestamps keep the "oldest" order unambiguous.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = partition.create_user("Bruno", Some("#3366ff".into())).await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let third = partition.create_user("Carla", None).await?;

    assert!(partition.switch_user(&third.id).await?);
    partition
        .ledger()
        .invoices
        .save(json!({ "id": "f-carla", "numero": "2025/7" }))
        .await?;
    partition.ledger().config.save(json!({ "aliquota": 5 })).await?;

    let generation = partition.feed().generation();
    partition.delete_user(&third.id).await?;
    assert!(partition.feed().generation() > generation);

    assert_eq!(partition.active_id(), Some(first.clone()));
    let remaining: Vec<_> = partition
        .list_users()
        .await?
        .into_iter()
        .map(|u| u.id)
        .collect();
    assert_eq!(remaining, vec![first, second.id]);

    let engine = partition.engine();
    assert!(engine.get(Collection::Invoices, "f-carla").await?.is_none());
    assert!(engine
        .get_all_for_user(Collection::Config, &third.id)
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn deleting_an_unknown_user_is_an_error() -> Result<()> {
    let partition = util::ready_partition().await?;
    partition.create_user("Bruno", None).await?;
    let err = partition
        .delete_user("nobody")
        .await
        .expect_err("unknown user");
    assert!(matches!(err, PartitionError::UnknownUser(id) if id == "nobody"));
    Ok(())
}

#[tokio::test]
async fn switching_scopes_every_accessor() -> Result<()> {
    let partition = util::ready_partition().await?;
    let first = partition.active_id().expect("active user");
    partition.ledger().work_logs.save(json!({ "ore": 2 })).await?;

    let other = partition.create_user("Dario", None).await?;
    assert!(partition.switch_user(&other.id).await?);
    assert!(partition.ledger().work_logs.list()?.is_empty());
    assert_eq!(partition.ledger().config.current()?, None);

    assert!(partition.switch_user(&first).await?);
    assert_eq!(partition.ledger().work_logs.list()?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn fallback_after_deleting_active_user_is_persisted() -> Result<()> {
    let engine = util::open_memory_engine().await?;
    for (id, created) in [("anna", "2021-01-01T00:00:00Z"), ("bruno", "2023-01-01T00:00:00Z")] {
        util::seed(
            &engine,
            Collection::Users,
            json!({ "id": id, "nome": id, "createdAt": created }),
        )
        .await?;
    }
    let prefs = StoreHandle::in_memory();
    prefs.put(ACTIVE_USER_KEY, json!("bruno"))?;
    let partition = UserPartition::new(engine, prefs.clone(), ChangeFeed::new());
    partition.initialize().await?;

    partition.delete_user("bruno").await?;
    assert_eq!(partition.active_id().as_deref(), Some("anna"));
    assert_eq!(prefs.snapshot().as_deref(), Some("anna"));
    Ok(())
}
