//! Products and the drafts they are registered from
use crate::error::RegistryError;
use crate::mirror::Document;
use crate::tracking::{Provenance, Tracked};
use crate::types::{ActorId, Currency, EntityKind};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Product {
    #[n(0)]
    pub id: String, // bech32, `prod_1...`
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub producer_id: ActorId,
    #[n(4)]
    pub price: u64, // minor units of `currency`
    #[n(5)]
    pub currency: Currency,
    #[n(6)]
    pub provenance: Provenance,
    #[n(7)]
    pub revision: u64, // confirmed amendments applied
}

impl Product {
    pub fn status(&self) -> crate::status::Status {
        self.provenance.status
    }
    pub fn quantity(&self) -> u64 {
        self.provenance.quantity
    }
    pub fn location(&self) -> &str {
        &self.provenance.location
    }
    pub fn current_owner(&self) -> &ActorId {
        &self.provenance.current_owner
    }
    pub fn tracking_history(&self) -> &[crate::tracking::TrackingRecord] {
        self.provenance.history.records()
    }
}

impl Document for Product {
    const KIND: EntityKind = EntityKind::Product;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Tracked for Product {
    fn originator(&self) -> &ActorId {
        &self.producer_id
    }
    fn provenance(&self) -> &Provenance {
        &self.provenance
    }
    fn provenance_mut(&mut self) -> &mut Provenance {
        &mut self.provenance
    }
    fn revision(&self) -> u64 {
        self.revision
    }
    fn amend(&mut self, amendment: &Amendment) -> Result<(), RegistryError> {
        amendment.validate()?;
        if let Some(name) = &amendment.name {
            self.name = name.trim().to_owned();
        }
        if let Some(description) = &amendment.description {
            self.description = description.clone();
        }
        if let Some(location) = &amendment.location {
            self.provenance.location = location.trim().to_owned();
        }
        self.revision += 1;
        Ok(())
    }
}

/// Changes a producer may make to a product before it is sold. Unset fields
/// are left as they are.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, PartialEq, Eq)]
pub struct Amendment {
    #[n(0)]
    pub name: Option<String>,
    #[n(1)]
    pub description: Option<String>,
    #[n(2)]
    pub location: Option<String>,
}

impl Amendment {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
    pub fn set_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.location.is_none()
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.is_empty() {
            return Err(RegistryError::Validation("amendment changes nothing".into()));
        }
        let blank = |field: &Option<String>| field.as_deref().is_some_and(|v| v.trim().is_empty());
        if blank(&self.name) {
            return Err(RegistryError::Validation("name is blank".into()));
        }
        if blank(&self.location) {
            return Err(RegistryError::Validation("location is blank".into()));
        }
        Ok(())
    }
}

/// Producer-supplied attributes of a product that is yet to be registered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProductDraft {
    name: Option<String>,
    description: Option<String>,
    location: Option<String>,
    price: u64,
    currency: Option<Currency>,
    quantity: u64,
}

impl ProductDraft {
    /// Construct a new builder object, this becomes the basis for a registration
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
    pub fn set_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
    pub fn set_price(mut self, price: u64, currency: Currency) -> Self {
        self.price = price;
        self.currency = Some(currency);
        self
    }
    pub fn set_quantity(mut self, quantity: u64) -> Self {
        self.quantity = quantity;
        self
    }

    // Checks fields and builds the genesis state of the product
    pub fn validate_and_finalise(
        &self,
        id: String,
        producer: &ActorId,
    ) -> Result<Product, RegistryError> {
        let required = |field: &Option<String>, name: &str| match field.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => Ok(value.to_owned()),
            _ => Err(RegistryError::Validation(format!("{name} is not set"))),
        };

        let name = required(&self.name, "name")?;
        let description = self.description.clone().unwrap_or_default();
        let location = required(&self.location, "location")?;

        let Some(currency) = self.currency else {
            return Err(RegistryError::Validation("price is not set".into()));
        };
        if self.price == 0 {
            return Err(RegistryError::Validation("price is set to zero".into()));
        }
        if self.quantity == 0 {
            return Err(RegistryError::Validation("quantity is set to zero".into()));
        }

        Ok(Product {
            id,
            name,
            description,
            producer_id: producer.clone(),
            price: self.price,
            currency,
            provenance: Provenance::new(
                EntityKind::Product,
                producer.clone(),
                self.quantity,
                location,
            ),
            revision: 0,
        })
    }
}
