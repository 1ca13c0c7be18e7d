//! Status vocabulary and the transition tables for ledger-backed entities
//!
//! Products and distributions share one vocabulary. Each kind accepts only the
//! edges listed in its table; a status with no outgoing edge is terminal.
use crate::types::{EntityKind, Role};
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    #[n(0)]
    Created,
    #[n(1)]
    Available,
    #[n(2)]
    InTransit,
    #[n(3)]
    Delivered,
    #[n(4)]
    Sold,
    #[n(5)]
    Cancelled,
    #[n(6)]
    PendingDistribution,
    #[n(7)]
    OutForDelivery,
    #[n(8)]
    ArrivedAtDestination,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::Created,
        Status::Available,
        Status::InTransit,
        Status::Delivered,
        Status::Sold,
        Status::Cancelled,
        Status::PendingDistribution,
        Status::OutForDelivery,
        Status::ArrivedAtDestination,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "CREATED",
            Status::Available => "AVAILABLE",
            Status::InTransit => "IN_TRANSIT",
            Status::Delivered => "DELIVERED",
            Status::Sold => "SOLD",
            Status::Cancelled => "CANCELLED",
            Status::PendingDistribution => "PENDING_DISTRIBUTION",
            Status::OutForDelivery => "OUT_FOR_DELIVERY",
            Status::ArrivedAtDestination => "ARRIVED_AT_DESTINATION",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra condition on the acting identity, checked after the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// The actor created the entity.
    Originator,
    /// The actor currently holds the entity.
    Holder,
    /// Any actor with a permitted role.
    Anyone,
    /// The current holder, or an admin.
    HolderOrAdmin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub roles: &'static [Role],
    pub guard: Guard,
    /// Removes units from the holder's stock.
    pub takes_stock: bool,
    /// The actor becomes the current holder.
    pub transfers: bool,
}

const PRODUCER: &[Role] = &[Role::Producer];
const DISTRIBUTOR: &[Role] = &[Role::Distributor];
const CUSTOMER: &[Role] = &[Role::Customer];
const EVERYONE: &[Role] = &[Role::Producer, Role::Distributor, Role::Customer, Role::Admin];

const CANCEL: Edge = Edge {
    roles: EVERYONE,
    guard: Guard::HolderOrAdmin,
    takes_stock: false,
    transfers: false,
};

pub fn initial(kind: EntityKind) -> Status {
    match kind {
        EntityKind::Distribution => Status::PendingDistribution,
        _ => Status::Created,
    }
}

/// Looks up the edge `from -> to` for `kind`. `None` means the edge does not exist.
pub fn edge(kind: EntityKind, from: Status, to: Status) -> Option<Edge> {
    use Status::*;

    match kind {
        EntityKind::Product => match (from, to) {
            (Created, Available) => Some(Edge {
                roles: PRODUCER,
                guard: Guard::Originator,
                takes_stock: false,
                transfers: false,
            }),
            // a product already in transit may have more units dispatched
            (Available | InTransit, InTransit) => Some(Edge {
                roles: DISTRIBUTOR,
                guard: Guard::Anyone,
                takes_stock: true,
                transfers: true,
            }),
            (InTransit, Delivered) => Some(Edge {
                roles: DISTRIBUTOR,
                guard: Guard::Holder,
                takes_stock: false,
                transfers: false,
            }),
            (Available, Sold) | (Delivered, Sold) => Some(Edge {
                roles: CUSTOMER,
                guard: Guard::Anyone,
                takes_stock: true,
                transfers: true,
            }),
            (Created | Available | InTransit | Delivered, Cancelled) => Some(CANCEL),
            _ => None,
        },
        EntityKind::Distribution => {
            let step = Edge {
                roles: DISTRIBUTOR,
                guard: Guard::Holder,
                takes_stock: false,
                transfers: false,
            };
            match (from, to) {
                (PendingDistribution, InTransit)
                | (InTransit, OutForDelivery)
                | (InTransit | OutForDelivery, ArrivedAtDestination)
                | (OutForDelivery | ArrivedAtDestination, Delivered) => Some(step),
                (
                    PendingDistribution | InTransit | OutForDelivery | ArrivedAtDestination,
                    Cancelled,
                ) => Some(CANCEL),
                _ => None,
            }
        }
        EntityKind::Order => None,
    }
}

/// Statuses reachable in one step from `from`.
pub fn targets(kind: EntityKind, from: Status) -> Vec<Status> {
    Status::ALL
        .into_iter()
        .filter(|to| edge(kind, from, *to).is_some())
        .collect()
}

pub fn is_terminal(kind: EntityKind, status: Status) -> bool {
    targets(kind, status).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_terminals() {
        assert!(is_terminal(EntityKind::Product, Status::Sold));
        assert!(is_terminal(EntityKind::Product, Status::Cancelled));
        assert!(!is_terminal(EntityKind::Product, Status::Delivered));
        assert!(!is_terminal(EntityKind::Product, Status::Created));
    }

    #[test]
    fn distribution_delivered_is_terminal() {
        assert!(is_terminal(EntityKind::Distribution, Status::Delivered));
        assert!(is_terminal(EntityKind::Distribution, Status::Cancelled));
        assert!(!is_terminal(EntityKind::Distribution, Status::PendingDistribution));
    }

    #[test]
    fn purchase_is_customer_only() {
        let edge = edge(EntityKind::Product, Status::Delivered, Status::Sold).unwrap();
        assert_eq!(edge.roles, &[Role::Customer]);
        assert!(edge.takes_stock);
    }

    #[test]
    fn further_dispatch_takes_stock() {
        let dispatch = edge(EntityKind::Product, Status::InTransit, Status::InTransit).unwrap();
        assert_eq!(dispatch.roles, &[Role::Distributor]);
        assert!(dispatch.takes_stock);
        assert!(edge(EntityKind::Product, Status::Delivered, Status::InTransit).is_none());
    }

    #[test]
    fn no_edge_skips_publication() {
        assert!(edge(EntityKind::Product, Status::Created, Status::InTransit).is_none());
        assert!(edge(EntityKind::Product, Status::Created, Status::Sold).is_none());
    }

    #[test]
    fn cancel_from_every_non_terminal_product_status() {
        for from in [Status::Created, Status::Available, Status::InTransit, Status::Delivered] {
            assert_eq!(edge(EntityKind::Product, from, Status::Cancelled), Some(CANCEL));
        }
    }

    #[test]
    fn statuses_outside_a_kind_have_no_edges() {
        assert!(targets(EntityKind::Product, Status::OutForDelivery).is_empty());
        assert_eq!(initial(EntityKind::Distribution), Status::PendingDistribution);
    }
}
