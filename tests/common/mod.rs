//! Shared setup for the integration tests
#![allow(dead_code)]

use anyhow::Context;
use std::sync::Arc;
use supply_trace::config::RegistryConfig;
use supply_trace::local_ledger::LocalLedger;
use supply_trace::mirror::SledMirror;
use supply_trace::product::{Product, ProductDraft};
use supply_trace::registry::{Outcome, Registry, Transition, TransitionContext};
use supply_trace::status::Status;
use supply_trace::types::{Actor, Currency};
use supply_trace::utils;
use tempfile::{TempDir, tempdir};

pub struct Harness {
    // keeps the sled directory alive for the test
    pub dir: TempDir,
    pub ledger: Arc<LocalLedger>,
    pub store: Arc<SledMirror>,
    pub registry: Registry,
    pub producer: Actor,
    pub distributor: Actor,
    pub customer: Actor,
    pub admin: Actor,
}

pub fn harness(name: &str) -> anyhow::Result<Harness> {
    harness_with(name, RegistryConfig::new())
}

pub fn harness_with(name: &str, config: RegistryConfig) -> anyhow::Result<Harness> {
    // Sled locks its directory, so every test gets its own database.
    let dir = tempdir()?;
    let db = sled::open(dir.path().join(format!("{name}.db")))?;
    let store = Arc::new(SledMirror::new(Arc::new(db)));
    let ledger = Arc::new(LocalLedger::new());
    let registry = Registry::new(ledger.clone(), store.clone(), config);

    Ok(Harness {
        dir,
        ledger,
        store,
        registry,
        producer: Actor::producer(utils::new_actor_id()?),
        distributor: Actor::distributor(utils::new_actor_id()?),
        customer: Actor::customer(utils::new_actor_id()?),
        admin: Actor::admin(utils::new_actor_id()?),
    })
}

pub fn coffee() -> ProductDraft {
    ProductDraft::new()
        .set_name("Arabica beans")
        .set_description("Single origin, 1kg bags")
        .set_location("Farm 7")
        .set_price(1_500, Currency::USD)
        .set_quantity(50)
}

pub fn committed<T>(outcome: Outcome<T>) -> anyhow::Result<Transition<T>> {
    outcome.committed().context("transition is still pending")
}

/// A registered product moved to AVAILABLE by its producer.
pub async fn published(h: &Harness) -> anyhow::Result<Product> {
    let product = h
        .registry
        .create_product(&coffee(), &h.producer)
        .await
        .context("registration failed")?;
    let outcome = h
        .registry
        .transition(&product.id, Status::Available, &h.producer, TransitionContext::new())
        .await
        .context("publication failed")?;
    Ok(committed(outcome)?.entity)
}
