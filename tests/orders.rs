mod common;

use anyhow::Context;
use common::{committed, harness, published};
use supply_trace::distribution::DistributionDraft;
use supply_trace::error::RegistryError;
use supply_trace::order::{DeliveryDetails, OrderStatus};
use supply_trace::registry::TransitionContext;
use supply_trace::status::Status;
use supply_trace::types::Actor;
use supply_trace::utils;

fn delivery() -> DeliveryDetails {
    DeliveryDetails::new("Ana Restrepo", "Calle 10 #43, Medellin").with_contact("+57 300 000 0000")
}

/// Place, confirm, ship, deliver and rate one order.
#[tokio::test]
async fn order_lifecycle() -> anyhow::Result<()> {
    let h = harness("order_lifecycle")?;
    let product = published(&h).await?;
    let orders = h.registry.orders();

    let order = orders
        .place(&h.customer, &product.id, 2, delivery())
        .await
        .context("Order failed on place: ")?;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.total_price, 3_000);
    assert_eq!(order.producer_id, h.producer.id);

    // orders reserve nothing, stock only moves on the ledger
    assert_eq!(h.registry.get_product(&product.id).await?.quantity(), 50);

    let order = orders.confirm(&order.id, &h.distributor).await?;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.distributor_id.as_ref(), Some(&h.distributor.id));

    let distribution = h
        .registry
        .create_distribution(
            &product.id,
            &DistributionDraft::new()
                .set_destination(order.delivery.address.clone())
                .set_quantity(order.quantity)
                .for_order(order.id.clone()),
            &h.distributor,
        )
        .await?;
    assert_eq!(distribution.order_id.as_deref(), Some(order.id.as_str()));

    let order = orders.ship(&order.id, &h.distributor, &distribution.id).await?;
    assert_eq!(order.status, OrderStatus::Shipped);
    assert_eq!(order.distribution_id.as_deref(), Some(distribution.id.as_str()));

    let err = orders.cancel(&order.id, &h.customer).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::OrderState {
            status: OrderStatus::Shipped,
            ..
        }
    ));

    let order = orders.deliver(&order.id, &h.distributor).await?;
    assert_eq!(order.status, OrderStatus::Delivered);

    let order = orders
        .rate(&order.id, &h.customer, 5, Some("arrived fresh".into()))
        .await?;
    let rating = order.rating.as_ref().context("rating not stored")?;
    assert_eq!(rating.score, 5);

    let err = orders.rate(&order.id, &h.customer, 4, None).await.unwrap_err();
    assert!(matches!(err, RegistryError::OrderState { .. }));

    let stored = orders.get(&order.id).await?;
    assert_eq!(stored, order);
    assert!(stored.placed_at <= stored.updated_at);

    Ok(())
}

#[tokio::test]
async fn placement_is_checked_against_the_product() -> anyhow::Result<()> {
    let h = harness("order_placement")?;
    let orders = h.registry.orders();

    let unpublished = h.registry.create_product(&common::coffee(), &h.producer).await?;
    let err = orders
        .place(&h.customer, &unpublished.id, 1, delivery())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::InvalidTransition {
            from: Status::Created,
            to: Status::Sold,
            ..
        }
    ));

    let product = published(&h).await?;
    let err = orders
        .place(&h.customer, &product.id, 51, delivery())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::InsufficientStock {
            requested: 51,
            available: 50,
            ..
        }
    ));

    let err = orders
        .place(&h.customer, &product.id, 0, delivery())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    let err = orders
        .place(&h.customer, &product.id, 1, DeliveryDetails::new("", "somewhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    let err = orders
        .place(&h.distributor, &product.id, 1, delivery())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnauthorizedActor { .. }));

    let err = orders
        .place(&h.customer, "prod_1missing", 1, delivery())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound { .. }));

    Ok(())
}

#[tokio::test]
async fn only_the_customer_or_an_admin_cancels() -> anyhow::Result<()> {
    let h = harness("order_cancel")?;
    let product = published(&h).await?;
    let orders = h.registry.orders();

    let first = orders.place(&h.customer, &product.id, 1, delivery()).await?;
    let second = orders.place(&h.customer, &product.id, 1, delivery()).await?;

    let someone_else = Actor::customer(utils::new_actor_id()?);
    let err = orders.cancel(&first.id, &someone_else).await.unwrap_err();
    assert!(matches!(err, RegistryError::UnauthorizedActor { .. }));

    let cancelled = orders.cancel(&first.id, &h.customer).await?;
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    orders.confirm(&second.id, &h.distributor).await?;
    let cancelled = orders.cancel(&second.id, &h.admin).await?;
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    let err = orders.confirm(&first.id, &h.distributor).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::OrderState {
            status: OrderStatus::Cancelled,
            ..
        }
    ));

    assert_eq!(orders.for_customer(&h.customer.id).await?.len(), 2);
    assert!(orders.for_customer(&someone_else.id).await?.is_empty());

    Ok(())
}

/// Shipping and delivery belong to the distributor that confirmed the order,
/// and the shipment must carry the ordered product.
#[tokio::test]
async fn fulfilment_is_tied_to_one_distributor() -> anyhow::Result<()> {
    let h = harness("order_fulfilment")?;
    let product = published(&h).await?;
    let other_product = published(&h).await?;
    let orders = h.registry.orders();
    let rival = Actor::distributor(utils::new_actor_id()?);

    let order = orders.place(&h.customer, &product.id, 3, delivery()).await?;
    assert_eq!(orders.for_distributor(&rival.id).await?.len(), 1);

    orders.confirm(&order.id, &h.distributor).await?;
    assert!(orders.for_distributor(&rival.id).await?.is_empty());
    assert_eq!(orders.for_distributor(&h.distributor.id).await?.len(), 1);

    let draft = DistributionDraft::new().set_destination("Medellin").set_quantity(3);
    let rival_shipment = h
        .registry
        .create_distribution(&product.id, &draft, &rival)
        .await?;
    let err = orders
        .ship(&order.id, &h.distributor, &rival_shipment.id)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnauthorizedActor { .. }));

    let wrong_goods = h
        .registry
        .create_distribution(&other_product.id, &draft, &h.distributor)
        .await?;
    let err = orders
        .ship(&order.id, &h.distributor, &wrong_goods.id)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    let shipment = h
        .registry
        .create_distribution(&product.id, &draft, &h.distributor)
        .await?;
    let err = orders.deliver(&order.id, &h.distributor).await.unwrap_err();
    assert!(matches!(err, RegistryError::OrderState { .. }));

    orders.ship(&order.id, &h.distributor, &shipment.id).await?;
    let err = orders.deliver(&order.id, &rival).await.unwrap_err();
    assert!(matches!(err, RegistryError::UnauthorizedActor { .. }));

    committed(
        h.registry
            .transition_distribution(
                &shipment.id,
                Status::InTransit,
                &h.distributor,
                TransitionContext::new(),
            )
            .await?,
    )?;
    let delivered = orders.deliver(&order.id, &h.distributor).await?;
    assert_eq!(delivered.status, OrderStatus::Delivered);

    let err = orders.rate(&order.id, &h.customer, 6, None).await.unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    Ok(())
}
