//! Utility functions for identifiers and hashing

use crate::types::{ActorId, EntityKind};
use bech32::Bech32m;
use std::convert::Infallible;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Fresh, collision-resistant id for a new entity of `kind`.
pub fn new_entity_id(kind: EntityKind) -> anyhow::Result<String> {
    new_uuid_to_bech32(kind.hrp())
}

pub fn new_actor_id() -> anyhow::Result<ActorId> {
    Ok(ActorId::new(new_uuid_to_bech32("user_")?))
}

/// Random component of an idempotency key.
pub fn new_nonce() -> String {
    hex::encode(uuid7().as_bytes())
}

// sha256 over the cbor encoding, hex encoded
pub fn digest<T: minicbor::Encode<()>>(
    value: &T,
) -> Result<String, minicbor::encode::Error<Infallible>> {
    let cbor = minicbor::to_vec(value)?;
    Ok(sha256::digest(&cbor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_carry_their_prefix() {
        let id = new_entity_id(EntityKind::Product).unwrap();
        assert!(id.starts_with("prod_1"));

        let id = new_entity_id(EntityKind::Distribution).unwrap();
        assert!(id.starts_with("dist_1"));
    }

    #[test]
    fn empty_hrp_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    #[test]
    fn nonces_are_unique() {
        assert_ne!(new_nonce(), new_nonce());
        assert_eq!(new_nonce().len(), 32);
    }
}
