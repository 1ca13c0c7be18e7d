use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use supply_trace::config::RegistryConfig;
use supply_trace::ledger::{EventKind, LedgerEvent};
use supply_trace::local_ledger::LocalLedger;
use supply_trace::mirror::SledMirror;
use supply_trace::product::{Amendment, ProductDraft};
use supply_trace::registry::{Registry, TransitionContext};
use supply_trace::status::Status;
use supply_trace::types::{Actor, Currency, EntityRef};
use supply_trace::utils;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Walks one product from registration to sale against an in-process ledger
/// and prints its reconciled history.
#[derive(Parser)]
#[command(name = "supply-trace")]
struct Args {
    /// Directory of the sled mirror.
    #[arg(long, env = "SUPPLY_TRACE_DB", default_value = "supply-trace.db")]
    db: String,

    #[arg(long, env = "SUPPLY_TRACE_CONFIRM_TIMEOUT_MS", default_value_t = 30_000)]
    confirm_timeout_ms: u64,

    /// Use a throwaway mirror instead of `--db`.
    #[arg(long)]
    fresh: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("supply_trace=info")),
        )
        .init();
    let args = Args::parse();

    let store = if args.fresh {
        SledMirror::temporary()?
    } else {
        SledMirror::open(&args.db).with_context(|| format!("opening mirror at {}", args.db))?
    };
    let config = RegistryConfig::new()
        .with_confirmation_timeout(Duration::from_millis(args.confirm_timeout_ms));
    let ledger = Arc::new(LocalLedger::new());
    let registry = Registry::new(ledger, Arc::new(store), config);

    let feed = registry.subscribe(
        EventKind::StatusChanged,
        Box::new(|event: LedgerEvent| {
            info!(entity = %event.action.entity, tx = %event.receipt.tx, "ledger event");
        }),
    );

    let producer = Actor::producer(utils::new_actor_id()?);
    let distributor = Actor::distributor(utils::new_actor_id()?);
    let customer = Actor::customer(utils::new_actor_id()?);

    let draft = ProductDraft::new()
        .set_name("Arabica beans")
        .set_description("Single origin, 1kg bags")
        .set_location("Farm 7, Huila")
        .set_price(1_500, Currency::USD)
        .set_quantity(50);
    let product = registry.create_product(&draft, &producer).await?;
    info!(product = %product.id, "registered");

    registry
        .transition(&product.id, Status::Available, &producer, TransitionContext::new())
        .await?
        .resolve()
        .await?;

    let amended = registry
        .amend_product(
            &product.id,
            &Amendment::new().set_description("Single origin, washed, 1kg bags"),
            &producer,
            TransitionContext::new(),
        )
        .await?;
    info!(product = %amended.id, revision = amended.revision, "amended");

    let dispatched = registry
        .transition(
            &product.id,
            Status::InTransit,
            &distributor,
            TransitionContext::new()
                .set_quantity(20)
                .set_location("Warehouse A, Bogota"),
        )
        .await?
        .resolve()
        .await?;
    info!(quantity = dispatched.entity.quantity(), "dispatched");

    let oversized = registry
        .transition(
            &product.id,
            Status::InTransit,
            &distributor,
            TransitionContext::new().set_quantity(40),
        )
        .await;
    if let Err(e) = oversized {
        warn!(error = %e, "second dispatch refused");
    }

    registry
        .transition(
            &product.id,
            Status::Delivered,
            &distributor,
            TransitionContext::new().set_location("Store 12, Medellin"),
        )
        .await?
        .resolve()
        .await?;
    registry
        .transition(
            &product.id,
            Status::Sold,
            &customer,
            TransitionContext::new().set_quantity(2),
        )
        .await?
        .resolve()
        .await?;

    for record in registry.get_history(&EntityRef::product(&product.id)).await? {
        println!(
            "{}  {:<12} {:<22} by {}  {}",
            record.timestamp,
            record.status.as_str(),
            record.location,
            record.updated_by,
            record.transaction_ref.unwrap_or_default()
        );
    }

    let verification = registry.verify_product(&product.id).await?;
    println!(
        "{} authentic={} head={}",
        verification.product.id,
        verification.is_authentic(),
        verification.head_hash
    );

    feed.close();
    Ok(())
}
