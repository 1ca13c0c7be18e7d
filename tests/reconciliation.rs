//! Mirror repair against the ledger
//!
//! Every test here damages the mirror behind the registry's back, straight
//! through the store, and checks that the next read brings it back in line
//! with ledger history.
mod common;

use anyhow::Context;
use common::{committed, harness, harness_with, published};
use std::time::Duration;
use supply_trace::config::RegistryConfig;
use supply_trace::error::RegistryError;
use supply_trace::ledger::{Action, LedgerEvent, Payload, Receipt, ReceiptStatus, TxRef};
use supply_trace::local_ledger::Finality;
use supply_trace::mirror::{Document, MirrorStore};
use supply_trace::product::Product;
use supply_trace::reconcile::Reconciliation;
use supply_trace::registry::TransitionContext;
use supply_trace::status::Status;
use supply_trace::tracking::TrackingRecord;
use supply_trace::types::{EntityRef, TimeStamp};

/// Published, dispatched and delivered: three records on the ledger.
async fn delivered(h: &common::Harness) -> anyhow::Result<(Product, Vec<u8>)> {
    let product = published(h).await?;
    let key = Product::key_for(&product.id);
    let after_publication = h.store.get(&key).await?.context("product not mirrored")?;

    committed(
        h.registry
            .transition(
                &product.id,
                Status::InTransit,
                &h.distributor,
                TransitionContext::new().set_quantity(20),
            )
            .await?,
    )?;
    let delivered = committed(
        h.registry
            .transition(&product.id, Status::Delivered, &h.distributor, TransitionContext::new())
            .await?,
    )?;

    Ok((delivered.entity, after_publication))
}

/// A mirror that missed the last N events is replayed to exactly the
/// ledger-derived state.
#[tokio::test]
async fn stale_mirror_is_replayed() -> anyhow::Result<()> {
    let h = harness("stale_mirror")?;
    let (fresh, stale) = delivered(&h).await?;
    h.store.set(&Product::key_for(&fresh.id), stale).await?;

    let reconciled = h
        .registry
        .reconciler()
        .reconcile::<Product>(&fresh.id)
        .await?
        .context("product vanished")?;
    assert_eq!(reconciled.outcome, Reconciliation::Replayed { events: 2 });
    assert_eq!(reconciled.document, fresh);
    assert_eq!(reconciled.document.status(), Status::Delivered);
    assert_eq!(reconciled.document.quantity(), 30);

    // repaired in place, so the next read is the fast path
    let again = h
        .registry
        .reconciler()
        .reconcile::<Product>(&fresh.id)
        .await?
        .context("product vanished")?;
    assert_eq!(again.outcome, Reconciliation::InSync);

    Ok(())
}

/// Reads go through reconciliation, so a stale mirror is never served.
#[tokio::test]
async fn reads_never_serve_a_stale_history() -> anyhow::Result<()> {
    let h = harness("reads_reconcile")?;
    let (fresh, stale) = delivered(&h).await?;
    h.store.set(&Product::key_for(&fresh.id), stale).await?;

    let history = h.registry.get_history(&EntityRef::product(&fresh.id)).await?;
    assert_eq!(history.as_slice(), fresh.tracking_history());

    Ok(())
}

/// A stale mirror is also caught up before the next transition validates.
#[tokio::test]
async fn transition_on_stale_mirror_sees_ledger_state() -> anyhow::Result<()> {
    let h = harness("transition_on_stale")?;
    let (fresh, stale) = delivered(&h).await?;
    h.store.set(&Product::key_for(&fresh.id), stale).await?;

    let err = h
        .registry
        .transition(
            &fresh.id,
            Status::Sold,
            &h.customer,
            TransitionContext::new().set_quantity(31),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::InsufficientStock { available: 30, .. }));

    let sold = committed(
        h.registry
            .transition(&fresh.id, Status::Sold, &h.customer, TransitionContext::new())
            .await?,
    )?;
    assert_eq!(sold.entity.tracking_history().len(), 4);

    Ok(())
}

/// A record the ledger never confirmed means the mirror is corrupt; it is
/// rebuilt from the registration onwards.
#[tokio::test]
async fn mirror_ahead_of_ledger_is_rebuilt() -> anyhow::Result<()> {
    let h = harness("mirror_ahead")?;
    let (fresh, _) = delivered(&h).await?;

    let mut forged = fresh.clone();
    let event = LedgerEvent {
        action: Action {
            key: format!("{}:SOLD:forged", fresh.id),
            entity: EntityRef::product(&fresh.id),
            actor: h.customer.id.clone(),
            payload: Payload::StatusChange {
                target: Status::Sold,
                location: "Nowhere".into(),
                notes: None,
                quantity: 30,
            },
        },
        receipt: Receipt {
            tx: TxRef::new("0xforged"),
            status: ReceiptStatus::Confirmed,
            timestamp: TimeStamp::new(),
            block: 99,
            seq: Some(3),
        },
    };
    let record = TrackingRecord::from_event(&event, forged.provenance.history.head_hash())?;
    forged.provenance.apply(Product::KIND, record)?;
    h.registry.mirror().save(&forged).await?;

    let reconciled = h
        .registry
        .reconciler()
        .reconcile::<Product>(&fresh.id)
        .await?
        .context("product vanished")?;
    assert_eq!(
        reconciled.outcome,
        Reconciliation::Rebuilt {
            mirror: 4,
            ledger: 3
        }
    );
    assert_eq!(reconciled.document, fresh);

    Ok(())
}

/// Same length, edited content: the hash chain gives it away.
#[tokio::test]
async fn tampered_record_is_rebuilt() -> anyhow::Result<()> {
    let h = harness("tampered_record")?;
    let (fresh, _) = delivered(&h).await?;

    let mut tampered = fresh.clone();
    let mut records = tampered.provenance.history.clone().into_records();
    records[1].location = "Somewhere else".into();
    tampered.provenance.history = records.into_iter().collect();
    h.registry.mirror().save(&tampered).await?;

    let reconciled = h
        .registry
        .reconciler()
        .reconcile::<Product>(&fresh.id)
        .await?
        .context("product vanished")?;
    assert_eq!(
        reconciled.outcome,
        Reconciliation::Rebuilt {
            mirror: 3,
            ledger: 3
        }
    );
    assert_eq!(reconciled.document, fresh);

    let verification = h.registry.verify_product(&fresh.id).await?;
    assert!(verification.is_authentic());

    Ok(())
}

/// With chain checks off, reads trust a same-length mirror and only explicit
/// verification notices the edit.
#[tokio::test]
async fn verification_reports_tampering_when_reads_do_not_check() -> anyhow::Result<()> {
    let h = harness_with(
        "verification_without_read_checks",
        RegistryConfig::new().with_chain_verification(false),
    )?;
    let (fresh, _) = delivered(&h).await?;

    let verification = h.registry.verify_product(&fresh.id).await?;
    assert!(verification.is_authentic());
    let last = fresh.tracking_history().last().context("empty history")?;
    assert_eq!(verification.head_hash, last.hash);

    let mut tampered = fresh.clone();
    let mut records = tampered.provenance.history.clone().into_records();
    records[0].notes = Some("certified organic".into());
    tampered.provenance.history = records.into_iter().collect();
    h.registry.mirror().save(&tampered).await?;

    let verification = h.registry.verify_product(&fresh.id).await?;
    assert!(!verification.chain_intact);
    assert!(verification.ledger_matches);
    assert!(!verification.is_authentic());

    Ok(())
}

/// A registration confirmed after the caller gave up is mirrored on first read.
#[tokio::test]
async fn late_registration_is_restored() -> anyhow::Result<()> {
    let h = harness_with(
        "late_registration",
        RegistryConfig::new().with_confirmation_timeout(Duration::from_millis(30)),
    )?;
    h.ledger.set_finality(Finality::Manual);

    let err = h
        .registry
        .create_product(&common::coffee(), &h.producer)
        .await
        .unwrap_err();
    let RegistryError::PendingRegistration { entity, .. } = &err else {
        anyhow::bail!("expected a pending registration, got {err:?}");
    };
    assert!(matches!(
        h.registry.get_product(&entity.id).await,
        Err(RegistryError::NotFound { .. })
    ));

    h.ledger.set_finality(Finality::Instant);
    assert_eq!(h.ledger.seal(), 1);

    let reconciled = h
        .registry
        .reconciler()
        .reconcile::<Product>(&entity.id)
        .await?
        .context("registration not restored")?;
    assert_eq!(reconciled.outcome, Reconciliation::Restored);
    assert_eq!(reconciled.document.status(), Status::Created);
    assert_eq!(reconciled.document.quantity(), 50);
    assert_eq!(reconciled.document.producer_id, h.producer.id);

    let published = committed(
        h.registry
            .transition(&entity.id, Status::Available, &h.producer, TransitionContext::new())
            .await?,
    )?;
    assert_eq!(published.entity.tracking_history().len(), 1);

    Ok(())
}

#[tokio::test]
async fn sweep_reports_only_repaired_entities() -> anyhow::Result<()> {
    let h = harness("sweep")?;
    let (fresh, stale) = delivered(&h).await?;
    let untouched = published(&h).await?;
    h.store.set(&Product::key_for(&fresh.id), stale).await?;

    let repaired = h.registry.sweep().await?;
    assert_eq!(
        repaired,
        vec![(
            EntityRef::product(&fresh.id),
            Reconciliation::Replayed { events: 2 }
        )]
    );
    assert!(h.registry.sweep().await?.is_empty());
    assert_eq!(h.registry.list_products().await?.len(), 2);
    assert_eq!(h.registry.get_product(&untouched.id).await?, untouched);

    Ok(())
}
