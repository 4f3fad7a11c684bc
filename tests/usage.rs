mod util;

use anyhow::{anyhow, Context};
use assert_matches::assert_matches;
use schema_lease::{Clock, Db, DescriptorId, DescriptorVersion, Error, SystemConfig, TestingKnobs};
use std::sync::Arc;
use std::time::Duration;
use util::*;

#[tokio::test]
async fn acquire_and_release() {
    let (db, gossip) = shared_store();
    let n = node_with(1, &db, Some(&gossip), |b| {
        b.testing_knobs(TestingKnobs {
            remove_once_dereferenced: true,
            ..Default::default()
        })
    });
    db.create_table(table(51, "kv")).unwrap();

    let mut txn = db.begin().await.unwrap();
    let lease = n
        .manager
        .acquire(&mut *txn, DescriptorId(51), None)
        .await
        .unwrap();
    txn.commit().await.unwrap();

    assert_eq!(lease.descriptor().version, DescriptorVersion(1));
    assert!(lease.expiration() > Clock::new().now(), "expired on arrival");
    let rows = db.lease_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].node_id, 1);
    assert_eq!(rows[0].version, DescriptorVersion(1));

    // releasing should asynchronously delete the row
    n.manager.release(lease).await;
    retry::until_ok(|| async {
        if db.lease_rows().is_empty() {
            Ok(())
        } else {
            Err(anyhow!("lease row still present"))
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_acquires_coalesce() {
    let (db, gossip) = shared_store();
    let n = node(1, &db, &gossip);
    db.create_table(table(51, "kv")).unwrap();

    let mut handles = Vec::new();
    for _ in 0..100 {
        let manager = n.manager.clone();
        let db = Arc::clone(&db);
        handles.push(tokio::spawn(async move {
            let mut txn = db.begin().await.unwrap();
            let lease = manager
                .acquire(&mut *txn, DescriptorId(51), None)
                .await
                .unwrap();
            txn.commit().await.unwrap();
            lease
        }));
    }
    let mut leases = Vec::new();
    for handle in handles {
        leases.push(handle.await.unwrap());
    }

    // every caller was served by a single store acquisition
    assert_eq!(db.lease_insert_count(), 1);
    assert_eq!(db.lease_rows().len(), 1);
    let expiration = leases[0].expiration();
    for lease in &leases {
        assert_eq!(lease.descriptor().version, DescriptorVersion(1));
        assert_eq!(lease.expiration(), expiration);
    }

    for lease in leases {
        n.manager.release(lease).await;
    }
    // the newest version stays cached and keeps its row
    assert_eq!(db.lease_rows().len(), 1);
}

#[tokio::test]
async fn acquire_by_name_hits_the_cache() {
    let (db, gossip) = shared_store();
    let n = node(1, &db, &gossip);
    db.create_table(table(51, "Users")).unwrap();

    let mut txn = db.begin().await.unwrap();
    let first = n
        .manager
        .acquire_by_name(&mut *txn, DB_ID, "users")
        .await
        .unwrap();
    assert_eq!(first.descriptor().id, DescriptorId(51));

    // a second lookup, differently cased, is served from the name cache
    let second = n
        .manager
        .acquire_by_name(&mut *txn, DB_ID, "USERS")
        .await
        .unwrap();
    assert_eq!(second.descriptor().id, DescriptorId(51));
    assert_eq!(db.lease_insert_count(), 1);

    assert_matches!(
        n.manager.acquire_by_name(&mut *txn, DB_ID, "missing").await,
        Err(Error::UndefinedTable(_))
    );

    n.manager.release(first).await;
    n.manager.release(second).await;
}

#[tokio::test]
async fn rename_refreshes_and_rechecks() {
    let (db, _gossip) = shared_store();
    let stale = node_without_refresh(1, &db);
    let publisher = node_without_refresh(2, &db);
    db.create_table(table(51, "t1")).unwrap();

    // warm node 1's caches with the pre-rename descriptor
    let mut txn = db.begin().await.unwrap();
    let warm = stale
        .manager
        .acquire_by_name(&mut *txn, DB_ID, "t1")
        .await
        .unwrap();
    stale.manager.release(warm).await;

    publisher
        .manager
        .publish(
            DescriptorId(51),
            |desc| {
                desc.name = "t2".into();
                Ok(())
            },
            None,
        )
        .await
        .unwrap();

    // The cached v1 snapshot still carries the old name. Resolving the
    // new name must detect the mismatch and refresh from the store.
    let fresh = stale
        .manager
        .acquire_by_name(&mut *txn, DB_ID, "t2")
        .await
        .unwrap();
    assert_eq!(fresh.descriptor().name, "t2");
    assert_eq!(fresh.descriptor().version, DescriptorVersion(2));
    stale.manager.release(fresh).await;
}

#[tokio::test]
async fn rename_turns_the_dangling_old_name_into_undefined() {
    let (db, _gossip) = shared_store();
    let publisher = node_without_refresh(1, &db);
    db.create_table(table(51, "t1")).unwrap();
    publisher
        .manager
        .publish(
            DescriptorId(51),
            |desc| {
                desc.name = "t2".into();
                Ok(())
            },
            None,
        )
        .await
        .unwrap();

    // A node with no cached state resolves "t1" through the dangling
    // name-index entry, lands on a descriptor now named "t2", refreshes,
    // re-checks, and reports the name as undefined rather than guessing.
    let n = node_without_refresh(3, &db);
    let mut txn = db.begin().await.unwrap();
    assert_matches!(
        n.manager.acquire_by_name(&mut *txn, DB_ID, "t1").await,
        Err(Error::UndefinedTable(_))
    );

    let lease = n
        .manager
        .acquire_by_name(&mut *txn, DB_ID, "t2")
        .await
        .unwrap();
    assert_eq!(lease.descriptor().name, "t2");
    n.manager.release(lease).await;
}

#[tokio::test]
async fn drop_refuses_new_leases_and_purges_inactive() {
    let (db, gossip) = shared_store();
    let n = node(1, &db, &gossip);
    let publisher = node_without_refresh(2, &db);
    db.create_table(table(51, "kv")).unwrap();

    // warm the cache, then leave the lease inactive
    let mut txn = db.begin().await.unwrap();
    let lease = n
        .manager
        .acquire(&mut *txn, DescriptorId(51), None)
        .await
        .unwrap();
    txn.commit().await.unwrap();
    n.manager.release(lease).await;
    assert_eq!(db.lease_rows().len(), 1);

    publisher
        .manager
        .publish(
            DescriptorId(51),
            |desc| {
                desc.dropped = true;
                Ok(())
            },
            None,
        )
        .await
        .unwrap();

    // the refresh worker purges the inactive lease and new acquisitions
    // are refused by the store's state filter
    retry::until_ok(|| async {
        let mut txn = db.begin().await.unwrap();
        match n.manager.acquire(&mut *txn, DescriptorId(51), None).await {
            Err(Error::TableDropped) => Ok(()),
            Ok(_) => Err(anyhow!("acquire still succeeds")),
            Err(err) => Err(anyhow!("unexpected error: {err}")),
        }
    })
    .await;
    retry::until_ok(|| async {
        if db.lease_rows().is_empty() {
            Ok(())
        } else {
            Err(anyhow!("lease rows still present"))
        }
    })
    .await;
}

#[tokio::test]
async fn drop_releases_active_leases_on_dereference() {
    let (db, gossip) = shared_store();
    let (refreshed_tx, mut refreshed_rx) = tokio::sync::mpsc::unbounded_channel();
    let n = node_with(1, &db, Some(&gossip), |b| {
        b.testing_knobs(TestingKnobs {
            leases_refreshed_event: Some(Arc::new(move |config: &SystemConfig| {
                if config.get(DescriptorId(51)).is_some_and(|d| d.dropped) {
                    let _ = refreshed_tx.send(());
                }
            })),
            ..Default::default()
        })
    });
    let publisher = node_without_refresh(2, &db);
    db.create_table(table(51, "kv")).unwrap();

    let mut txn = db.begin().await.unwrap();
    let held = n
        .manager
        .acquire(&mut *txn, DescriptorId(51), None)
        .await
        .unwrap();
    txn.commit().await.unwrap();

    publisher
        .manager
        .publish(
            DescriptorId(51),
            |desc| {
                desc.dropped = true;
                Ok(())
            },
            None,
        )
        .await
        .unwrap();

    // wait until the refresh worker has seen the drop; the held lease
    // survives it
    tokio::time::timeout(TEST_WAIT, refreshed_rx.recv())
        .await
        .expect("refresh never processed the drop");
    assert_eq!(db.lease_rows().len(), 1);

    // dereferencing the held lease now releases it eagerly
    n.manager.release(held).await;
    retry::until_ok(|| async {
        if db.lease_rows().is_empty() {
            Ok(())
        } else {
            Err(anyhow!("lease row still present"))
        }
    })
    .await;
}

#[tokio::test]
async fn short_leases_are_refreshed_after_expiry() {
    let (db, gossip) = shared_store();
    let n = node_with(1, &db, Some(&gossip), |b| {
        b.lease_duration(Duration::from_millis(200))
            .min_lease_duration(Duration::from_millis(100))
    });
    db.create_table(table(51, "kv")).unwrap();

    let mut txn = db.begin().await.unwrap();
    let first = n
        .manager
        .acquire(&mut *txn, DescriptorId(51), None)
        .await
        .unwrap();
    let first_expiration = first.expiration();
    n.manager.release(first).await;
    assert_eq!(db.lease_insert_count(), 1);

    // once the cached lease has less than the minimum life left, a
    // newest-version request goes back to the store
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = n
        .manager
        .acquire(&mut *txn, DescriptorId(51), None)
        .await
        .unwrap();
    assert_eq!(db.lease_insert_count(), 2);
    assert!(second.expiration() > first_expiration);
    n.manager.release(second).await;
}

#[tokio::test]
async fn draining_refuses_and_cleans_up() {
    let (db, gossip) = shared_store();
    let n = node(1, &db, &gossip);
    db.create_table(table(51, "kv")).unwrap();
    db.create_table(table(52, "audit")).unwrap();

    let mut txn = db.begin().await.unwrap();
    let held = n
        .manager
        .acquire(&mut *txn, DescriptorId(51), None)
        .await
        .unwrap();
    let inactive = n
        .manager
        .acquire(&mut *txn, DescriptorId(52), None)
        .await
        .unwrap();
    txn.commit().await.unwrap();
    n.manager.release(inactive).await;
    assert_eq!(db.lease_rows().len(), 2);

    // draining releases the inactive lease synchronously
    n.manager.set_draining(true).await;
    assert_eq!(db.lease_rows().len(), 1);

    let mut txn = db.begin().await.unwrap();
    assert_matches!(
        n.manager.acquire(&mut *txn, DescriptorId(51), None).await,
        Err(Error::Draining)
    );
    assert_matches!(
        n.manager.acquire_by_name(&mut *txn, DB_ID, "kv").await,
        Err(Error::Draining)
    );

    // the active lease is released durably the moment its holder is done
    n.manager.release(held).await;
    assert!(db.lease_rows().is_empty());
    n.stopper.stop().await;
}

#[tokio::test]
async fn dropping_the_handle_releases_in_background() {
    let (db, gossip) = shared_store();
    let n = node_with(1, &db, Some(&gossip), |b| {
        b.testing_knobs(TestingKnobs {
            remove_once_dereferenced: true,
            ..Default::default()
        })
    });
    db.create_table(table(51, "kv")).unwrap();

    let mut txn = db.begin().await.unwrap();
    let lease = n
        .manager
        .acquire(&mut *txn, DescriptorId(51), None)
        .await
        .unwrap();
    drop(lease);

    retry::until_ok(|| async {
        db.lease_rows()
            .is_empty()
            .then_some(())
            .context("lease row still present")
    })
    .await;
}
