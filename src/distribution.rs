use crate::error::RegistryError;
use crate::mirror::Document;
use crate::tracking::{Provenance, Tracked};
use crate::types::{ActorId, EntityKind};

/// A shipment of units of one product to a destination. Its tracking
/// updates follow the same append-only discipline as product history.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub product_id: String,
    #[n(2)]
    pub distributor_id: ActorId,
    #[n(3)]
    pub destination: String,
    #[n(4)]
    pub transport_method: Option<String>,
    #[n(5)]
    pub estimated_delivery: Option<String>,
    #[n(6)]
    pub order_id: Option<String>,
    #[n(7)]
    pub provenance: Provenance,
}

impl Distribution {
    pub fn status(&self) -> crate::status::Status {
        self.provenance.status
    }
    pub fn quantity(&self) -> u64 {
        self.provenance.quantity
    }
    pub fn tracking_updates(&self) -> &[crate::tracking::TrackingRecord] {
        self.provenance.history.records()
    }
}

impl Document for Distribution {
    const KIND: EntityKind = EntityKind::Distribution;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Tracked for Distribution {
    fn originator(&self) -> &ActorId {
        &self.distributor_id
    }
    fn provenance(&self) -> &Provenance {
        &self.provenance
    }
    fn provenance_mut(&mut self) -> &mut Provenance {
        &mut self.provenance
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DistributionDraft {
    origin: Option<String>,
    destination: Option<String>,
    quantity: u64,
    transport_method: Option<String>,
    estimated_delivery: Option<String>,
    order_id: Option<String>,
}

impl DistributionDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
    pub fn set_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
    pub fn set_quantity(mut self, quantity: u64) -> Self {
        self.quantity = quantity;
        self
    }
    pub fn set_transport_method(mut self, method: impl Into<String>) -> Self {
        self.transport_method = Some(method.into());
        self
    }
    pub fn set_estimated_delivery(mut self, eta: impl Into<String>) -> Self {
        self.estimated_delivery = Some(eta.into());
        self
    }
    pub fn for_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// `default_origin` is used when no origin was set, usually the product's location.
    pub fn validate_and_finalise(
        &self,
        id: String,
        product_id: &str,
        distributor: &ActorId,
        default_origin: &str,
    ) -> Result<Distribution, RegistryError> {
        let destination = match self.destination.as_deref().map(str::trim) {
            Some(d) if !d.is_empty() => d.to_owned(),
            _ => return Err(RegistryError::Validation("destination is not set".into())),
        };
        if self.quantity == 0 {
            return Err(RegistryError::Validation("quantity is set to zero".into()));
        }
        let origin = self
            .origin
            .clone()
            .unwrap_or_else(|| default_origin.to_owned());

        Ok(Distribution {
            id,
            product_id: product_id.to_owned(),
            distributor_id: distributor.clone(),
            destination,
            transport_method: self.transport_method.clone(),
            estimated_delivery: self.estimated_delivery.clone(),
            order_id: self.order_id.clone(),
            provenance: Provenance::new(
                EntityKind::Distribution,
                distributor.clone(),
                self.quantity,
                origin,
            ),
        })
    }
}
