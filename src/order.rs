//! Customer orders
//!
//! Orders are application state kept in the mirror only; nothing about them
//! is written to the ledger. Stock only moves when the product itself is
//! transitioned, so placing an order checks availability but reserves nothing.
use crate::error::RegistryError;
use crate::mirror::{Change, Document};
use crate::registry::Registry;
use crate::status::{self, Status};
use crate::types::{Actor, ActorId, Currency, EntityKind, EntityRef, Role, TimeStamp};
use crate::utils;
use chrono::Utc;
use std::fmt;
use tracing::info;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Confirmed,
    #[n(2)]
    Shipped,
    #[n(3)]
    Delivered,
    #[n(4)]
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DeliveryDetails {
    #[n(0)]
    pub recipient: String,
    #[n(1)]
    pub address: String,
    #[n(2)]
    pub contact: Option<String>,
}

impl DeliveryDetails {
    pub fn new(recipient: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            address: address.into(),
            contact: None,
        }
    }
    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Rating {
    #[n(0)]
    pub score: u8, // 1..=5
    #[n(1)]
    pub feedback: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Order {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub customer_id: ActorId,
    #[n(2)]
    pub product_id: String,
    #[n(3)]
    pub producer_id: ActorId,
    #[n(4)]
    pub quantity: u64,
    #[n(5)]
    pub total_price: u64,
    #[n(6)]
    pub currency: Currency,
    #[n(7)]
    pub delivery: DeliveryDetails,
    #[n(8)]
    pub status: OrderStatus,
    #[n(9)]
    pub distributor_id: Option<ActorId>,
    #[n(10)]
    pub distribution_id: Option<String>,
    #[n(11)]
    pub placed_at: TimeStamp<Utc>,
    #[n(12)]
    pub updated_at: TimeStamp<Utc>,
    #[n(13)]
    pub rating: Option<Rating>,
}

impl Document for Order {
    const KIND: EntityKind = EntityKind::Order;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Order {
    fn entity(&self) -> EntityRef {
        EntityRef::new(EntityKind::Order, &self.id)
    }

    fn require_status(
        &self,
        allowed: &[OrderStatus],
        action: &'static str,
    ) -> Result<(), RegistryError> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        Err(RegistryError::OrderState {
            order: self.id.clone(),
            status: self.status,
            action,
        })
    }

    fn expect_distributor(&self, actor: &Actor, action: &str) -> Result<(), RegistryError> {
        if self.distributor_id.as_ref() == Some(&actor.id) {
            return Ok(());
        }
        Err(unauthorized(self.entity(), actor, action))
    }
}

fn unauthorized(entity: EntityRef, actor: &Actor, action: &str) -> RegistryError {
    RegistryError::UnauthorizedActor {
        entity,
        role: actor.role,
        action: action.to_owned(),
    }
}

fn require_role(
    entity: &EntityRef,
    actor: &Actor,
    role: Role,
    action: &str,
) -> Result<(), RegistryError> {
    if actor.role == role {
        Ok(())
    } else {
        Err(unauthorized(entity.clone(), actor, action))
    }
}

/// Order operations over a registry's mirror and lease table.
#[derive(Clone)]
pub struct OrderBook {
    registry: Registry,
}

impl OrderBook {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub async fn place(
        &self,
        customer: &Actor,
        product_id: &str,
        quantity: u64,
        delivery: DeliveryDetails,
    ) -> Result<Order, RegistryError> {
        let product_ref = EntityRef::product(product_id);
        require_role(&product_ref, customer, Role::Customer, "place an order")?;

        if quantity == 0 {
            return Err(RegistryError::Validation("order quantity is zero".into()));
        }
        if delivery.recipient.trim().is_empty() || delivery.address.trim().is_empty() {
            return Err(RegistryError::Validation("delivery details are incomplete".into()));
        }

        let product = self.registry.get_product(product_id).await?;
        if status::edge(EntityKind::Product, product.status(), Status::Sold).is_none() {
            return Err(RegistryError::InvalidTransition {
                entity: product_ref,
                from: product.status(),
                to: Status::Sold,
            });
        }
        if quantity > product.quantity() {
            return Err(RegistryError::InsufficientStock {
                entity: product_ref,
                requested: quantity,
                available: product.quantity(),
            });
        }

        let id = utils::new_entity_id(EntityKind::Order)
            .map_err(|e| RegistryError::Identifier(e.to_string()))?;
        let now = TimeStamp::new();
        let order = Order {
            id,
            customer_id: customer.id.clone(),
            product_id: product.id.clone(),
            producer_id: product.producer_id.clone(),
            quantity,
            total_price: product.price.saturating_mul(quantity),
            currency: product.currency,
            delivery,
            status: OrderStatus::Pending,
            distributor_id: None,
            distribution_id: None,
            placed_at: now.clone(),
            updated_at: now,
            rating: None,
        };

        if !self.registry.mirror().insert_new(&order).await? {
            return Err(RegistryError::Identifier(format!("{} already in use", order.id)));
        }
        info!(order = %order.id, product = %order.product_id, quantity, "order placed");
        Ok(order)
    }

    pub async fn get(&self, order_id: &str) -> Result<Order, RegistryError> {
        self.registry
            .mirror()
            .load::<Order>(order_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound {
                entity: EntityRef::new(EntityKind::Order, order_id),
            })
    }

    pub async fn for_customer(&self, customer: &ActorId) -> Result<Vec<Order>, RegistryError> {
        let orders = self.registry.mirror().list::<Order>().await?;
        Ok(orders
            .into_iter()
            .filter(|o| &o.customer_id == customer)
            .collect())
    }

    /// Orders a distributor has accepted, plus every order still waiting for one.
    pub async fn for_distributor(
        &self,
        distributor: &ActorId,
    ) -> Result<Vec<Order>, RegistryError> {
        let orders = self.registry.mirror().list::<Order>().await?;
        Ok(orders
            .into_iter()
            .filter(|o| match &o.distributor_id {
                Some(id) => id == distributor,
                None => o.status == OrderStatus::Pending,
            })
            .collect())
    }

    /// A distributor takes on a pending order.
    pub async fn confirm(
        &self,
        order_id: &str,
        distributor: &Actor,
    ) -> Result<Order, RegistryError> {
        let entity = EntityRef::new(EntityKind::Order, order_id);
        require_role(&entity, distributor, Role::Distributor, "confirm an order")?;

        self.advance(order_id, "confirmed", |order| {
            order.require_status(&[OrderStatus::Pending], "confirmed")?;
            order.status = OrderStatus::Confirmed;
            order.distributor_id = Some(distributor.id.clone());
            Ok(())
        })
        .await
    }

    /// Links the order to the distribution that carries it.
    pub async fn ship(
        &self,
        order_id: &str,
        distributor: &Actor,
        distribution_id: &str,
    ) -> Result<Order, RegistryError> {
        let entity = EntityRef::new(EntityKind::Order, order_id);
        require_role(&entity, distributor, Role::Distributor, "ship an order")?;

        let order = self.get(order_id).await?;
        let distribution = self.registry.get_distribution(distribution_id).await?;
        if distribution.distributor_id != distributor.id {
            return Err(unauthorized(
                EntityRef::distribution(distribution_id),
                distributor,
                "ship with another distributor's distribution",
            ));
        }
        if distribution.product_id != order.product_id {
            return Err(RegistryError::Validation(format!(
                "distribution {} carries {}, order {} is for {}",
                distribution.id, distribution.product_id, order.id, order.product_id
            )));
        }

        self.advance(order_id, "shipped", |order| {
            order.require_status(&[OrderStatus::Confirmed], "shipped")?;
            order.expect_distributor(distributor, "ship this order")?;
            order.status = OrderStatus::Shipped;
            order.distribution_id = Some(distribution.id.clone());
            Ok(())
        })
        .await
    }

    pub async fn deliver(
        &self,
        order_id: &str,
        distributor: &Actor,
    ) -> Result<Order, RegistryError> {
        let entity = EntityRef::new(EntityKind::Order, order_id);
        require_role(&entity, distributor, Role::Distributor, "deliver an order")?;

        self.advance(order_id, "delivered", |order| {
            order.require_status(&[OrderStatus::Shipped], "delivered")?;
            order.expect_distributor(distributor, "deliver this order")?;
            order.status = OrderStatus::Delivered;
            Ok(())
        })
        .await
    }

    /// The ordering customer or an admin may cancel before shipping.
    pub async fn cancel(&self, order_id: &str, actor: &Actor) -> Result<Order, RegistryError> {
        self.advance(order_id, "cancelled", |order| {
            let own = actor.role == Role::Customer && order.customer_id == actor.id;
            if !own && actor.role != Role::Admin {
                return Err(unauthorized(order.entity(), actor, "cancel this order"));
            }
            order.require_status(&[OrderStatus::Pending, OrderStatus::Confirmed], "cancelled")?;
            order.status = OrderStatus::Cancelled;
            Ok(())
        })
        .await
    }

    pub async fn rate(
        &self,
        order_id: &str,
        customer: &Actor,
        score: u8,
        feedback: Option<String>,
    ) -> Result<Order, RegistryError> {
        if !(1..=5).contains(&score) {
            return Err(RegistryError::Validation(format!(
                "rating {score} is outside 1..=5"
            )));
        }

        self.advance(order_id, "rated", |order| {
            if customer.role != Role::Customer || order.customer_id != customer.id {
                return Err(unauthorized(order.entity(), customer, "rate this order"));
            }
            order.require_status(&[OrderStatus::Delivered], "rated")?;
            if order.rating.is_some() {
                return Err(RegistryError::OrderState {
                    order: order.id.clone(),
                    status: order.status,
                    action: "rated again",
                });
            }
            order.rating = Some(Rating {
                score,
                feedback: feedback.clone(),
            });
            Ok(())
        })
        .await
    }

    // one order change under the order's lease
    async fn advance<F>(
        &self,
        order_id: &str,
        action: &'static str,
        mut step: F,
    ) -> Result<Order, RegistryError>
    where
        F: FnMut(&mut Order) -> Result<(), RegistryError> + Send,
    {
        let entity = EntityRef::new(EntityKind::Order, order_id);
        let _lease = self.registry.leases().acquire(&entity.key()).await;

        let updated = self
            .registry
            .mirror()
            .update::<Order, RegistryError, _>(order_id, |order| {
                step(order)?;
                order.updated_at = TimeStamp::new();
                Ok(Change::Modified)
            })
            .await?;

        let order = updated.ok_or(RegistryError::NotFound { entity })?;
        info!(order = %order.id, status = %order.status, action, "order updated");
        Ok(order)
    }
}
