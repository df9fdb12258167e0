use anyhow::Result;
use libretto_lib::db::{config_id_for, Collection, LEGACY_CONFIG_ID};
use libretto_lib::user_active::{StoreHandle, ACTIVE_USER_KEY};
use libretto_lib::{ChangeFeed, PartitionError, PartitionState, UserPartition};
use proptest::prelude::*;
use serde_json::json;
#[path = "util.rs"]
mod util;

#[tokio::test]
async fn unstamped_client_is_claimed_by_the_only_user() -> Result<()> {
    let engine = util::open_memory_engine().await?;
    util::seed(
        &engine,
        Collection::Users,
        json!({ "id": "anna", "nome": "Anna", "createdAt": "2024-02-01T09:00:00Z" }),
    )
    .await?;
    util::seed(
        &engine,
        Collection::Clients,
        json!({ "id": "c1", "nome": "Bar Centrale" }),
    )
    .await?;

    let partition = util::partition_over(engine.clone());
    let report = partition.initialize().await?;
    assert!(!report.created_user);
    assert_eq!(report.stamped, 1);
    assert_eq!(partition.active_id().as_deref(), Some("anna"));

    let client = engine
        .get(Collection::Clients, "c1")
        .await?
        .expect("client kept");
    assert_eq!(client.user_id(), Some("anna"));
    assert_eq!(client.get("nome"), Some(&json!("Bar Centrale")));
    Ok(())
}

#[tokio::test]
async fn valid_pointer_takes_the_fast_path() -> Result<()> {
    let engine = util::open_memory_engine().await?;
    for (id, created) in [("old", "2020-01-01T00:00:00Z"), ("new", "2024-01-01T00:00:00Z")] {
        util::seed(
            &engine,
            Collection::Users,
            json!({ "id": id, "nome": id, "createdAt": created }),
        )
        .await?;
    }
    util::seed(&engine, Collection::Clients, json!({ "id": "loose" })).await?;

    let prefs = StoreHandle::in_memory();
    prefs.put(ACTIVE_USER_KEY, json!("new"))?;
    let partition = UserPartition::new(engine.clone(), prefs, ChangeFeed::new());
    let report = partition.initialize().await?;

    assert_eq!(report.stamped, 0);
    assert_eq!(partition.active_id().as_deref(), Some("new"));
    assert_eq!(partition.state(), PartitionState::Ready);
    // The fast path leaves unowned data for the next full migration.
    let loose = engine.get(Collection::Clients, "loose").await?.expect("kept");
    assert_eq!(loose.user_id(), None);
    Ok(())
}

#[tokio::test]
async fn stale_pointer_falls_back_to_oldest_user() -> Result<()> {
    let engine = util::open_memory_engine().await?;
    for (id, created) in [("b", "2023-01-01T00:00:00Z"), ("a", "2023-01-01T00:00:00Z")] {
        util::seed(
            &engine,
            Collection::Users,
            json!({ "id": id, "nome": id, "createdAt": created }),
        )
        .await?;
    }
    let prefs = StoreHandle::in_memory();
    prefs.put(ACTIVE_USER_KEY, json!("deleted-user"))?;
    let partition = UserPartition::new(engine, prefs.clone(), ChangeFeed::new());
    partition.initialize().await?;

    // Equal timestamps: the lower id wins.
    assert_eq!(partition.active_id().as_deref(), Some("a"));
    assert_eq!(prefs.snapshot().as_deref(), Some("a"));
    Ok(())
}

#[tokio::test]
async fn legacy_config_is_dropped_when_user_already_has_one() -> Result<()> {
    let engine = util::open_memory_engine().await?;
    util::seed(&engine, Collection::Users, json!({ "id": "u1", "nome": "U" })).await?;
    util::seed(
        &engine,
        Collection::Config,
        json!({ "id": "config_u1", "userId": "u1", "aliquota": 5 }),
    )
    .await?;
    util::seed(
        &engine,
        Collection::Config,
        json!({ "id": LEGACY_CONFIG_ID, "aliquota": 15 }),
    )
    .await?;

    let partition = util::partition_over(engine.clone());
    let report = partition.initialize().await?;
    assert!(report.renamed_config);

    let configs = engine.get_all(Collection::Config).await?;
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].id(), config_id_for("u1"));
    assert_eq!(configs[0].get("aliquota"), Some(&json!(5)));
    Ok(())
}

#[tokio::test]
async fn reads_before_initialize_are_rejected() -> Result<()> {
    let partition = util::partition_over(util::open_memory_engine().await?);
    assert!(matches!(
        partition.ledger().clients.list(),
        Err(PartitionError::NotReady)
    ));
    assert!(matches!(
        partition.migrate_after_import().await,
        Err(PartitionError::NotReady)
    ));
    Ok(())
}

#[derive(Debug, Clone)]
struct LegacyRecord {
    collection: Collection,
    owned: bool,
}

fn legacy_record() -> impl Strategy<Value = LegacyRecord> {
    (
        prop::sample::select(Collection::USER_DATA.to_vec()),
        any::<bool>(),
    )
        .prop_map(|(collection, owned)| LegacyRecord { collection, owned })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn migration_is_idempotent(
        users in 0usize..3,
        records in prop::collection::vec(legacy_record(), 0..12),
        legacy_config in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let engine = util::open_memory_engine().await.expect("engine");
            for n in 0..users {
                util::seed(
                    &engine,
                    Collection::Users,
                    json!({ "id": format!("user-{n}"), "nome": format!("User {n}"),
                            "createdAt": format!("202{n}-01-01T00:00:00Z") }),
                )
                .await
                .expect("seed user");
            }
            for (index, record) in records.iter().enumerate() {
                let mut value = json!({ "id": format!("r{index}") });
                if record.owned {
                    value["userId"] = json!("someone");
                }
                util::seed(&engine, record.collection, value).await.expect("seed record");
            }
            if legacy_config {
                util::seed(&engine, Collection::Config, json!({ "id": "default", "tema": "scuro" }))
                    .await
                    .expect("seed config");
            }

            let partition = util::partition_over(engine.clone());
            partition.initialize().await.expect("first migration");
            let after_first = engine.export_all().await.expect("export");

            for collection in Collection::PARTITIONED {
                for record in after_first.get(collection).unwrap_or_default() {
                    assert!(record.user_id().is_some(), "{collection}/{} unowned", record.id());
                }
            }
            assert!(engine.get(Collection::Config, "default").await.expect("get").is_none());
            assert!(!after_first.get(Collection::Users).unwrap_or_default().is_empty());

            let report = partition.migrate_after_import().await.expect("second migration");
            assert!(!report.changed());
            let after_second = engine.export_all().await.expect("export");
            assert_eq!(after_first, after_second);
        });
    }
}
