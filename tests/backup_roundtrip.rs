use anyhow::Result;
use libretto_lib::backup::{self, BackupError};
use libretto_lib::db::{Collection, SnapshotError, SyncSnapshot};
use serde_json::json;
use tempfile::tempdir;
#[path = "util.rs"]
mod util;

#[tokio::test]
async fn backup_moves_one_users_data_to_another() -> Result<()> {
    let partition = util::ready_partition().await?;
    let anna = partition.active_id().expect("active user");
    let ledger = partition.ledger();
    ledger.clients.save(json!({ "id": "c1", "nome": "Ferramenta" })).await?;
    ledger
        .invoices
        .save(json!({ "id": "f1", "cliente": "c1", "totale": 244.0 }))
        .await?;
    ledger.config.save(json!({ "regime": "ordinario" })).await?;

    let dir = tempdir()?;
    let path = dir.path().join("exports").join("anna.json");
    let snapshot = backup::export_backup(partition.engine(), &anna).await?;
    backup::write_backup(&path, &snapshot).await?;

    let bruno = partition.create_user("Bruno", None).await?;
    assert!(partition.switch_user(&bruno.id).await?);
    ledger.clients.save(json!({ "id": "mine", "nome": "Vecchio" })).await?;

    let restored = backup::read_backup(&path).await?;
    assert_eq!(restored, snapshot);
    let summary = backup::import_backup(&partition, &bruno.id, &restored).await?;
    assert_eq!(summary.records, 3);

    let clients: Vec<_> = ledger
        .clients
        .list()?
        .iter()
        .map(|r| (r.id().to_string(), r.user_id().map(str::to_owned)))
        .collect();
    assert_eq!(clients, vec![("c1".to_string(), Some(bruno.id.clone()))]);
    let config = ledger.config.current()?.expect("config adopted");
    assert_eq!(config.id(), format!("config_{}", bruno.id));
    assert_eq!(config.get("regime"), Some(&json!("ordinario")));

    // The users array in the file is ignored: no user was added or renamed.
    assert_eq!(partition.list_users().await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn malformed_backup_changes_nothing() -> Result<()> {
    let partition = util::ready_partition().await?;
    partition
        .ledger()
        .deadlines
        .save(json!({ "id": "s1", "titolo": "INPS" }))
        .await?;
    let before = partition.engine().export_all().await?;

    let dir = tempdir()?;
    let path = dir.path().join("broken.json");
    std::fs::write(&path, r#"{ "scadenze": [ { "id": "s2" } ], "clienti": "oops" }"#)?;
    let err = backup::read_backup(&path).await.expect_err("malformed");
    assert!(matches!(
        err,
        BackupError::Snapshot(SnapshotError::NotAnArray { .. })
    ));

    assert_eq!(partition.engine().export_all().await?, before);
    assert_eq!(
        partition
            .engine()
            .get_all(Collection::Deadlines)
            .await?
            .len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn collections_missing_from_backup_are_emptied() -> Result<()> {
    let partition = util::ready_partition().await?;
    let anna = partition.active_id().expect("active user");
    let ledger = partition.ledger();
    ledger.invoices.save(json!({ "id": "old-invoice" })).await?;
    ledger.clients.save(json!({ "id": "old-client" })).await?;
    ledger.work_logs.save(json!({ "id": "old-log", "ore": 2 })).await?;

    // Another user's records survive the replace.
    let bruno = partition.create_user("Bruno", None).await?;
    util::seed(
        partition.engine(),
        Collection::Invoices,
        json!({ "id": "bruno-invoice", "userId": bruno.id.clone() }),
    )
    .await?;

    let snapshot = SyncSnapshot::from_value(json!({
        "clienti": [ { "id": "new-client" } ]
    }))?;
    let summary = backup::import_backup(&partition, &anna, &snapshot).await?;
    assert_eq!(summary.records, 1);

    let ids = |records: Vec<libretto_lib::Record>| {
        records
            .iter()
            .map(|r| r.id().to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(ledger.clients.list()?), vec!["new-client"]);
    assert!(ledger.invoices.list()?.is_empty());
    assert!(ledger.work_logs.list()?.is_empty());
    assert_eq!(
        ids(partition
            .engine()
            .get_all_for_user(Collection::Invoices, &bruno.id)
            .await?),
        vec!["bruno-invoice"]
    );
    Ok(())
}
