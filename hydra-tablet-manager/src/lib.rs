// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! Master-side tablet management: the catalog of tablet owners, tablets,
//! cells, bundles, replicas and actions, plus the lifecycle controller
//! that drives tablets through mount, freeze, reshard and move via
//! idempotent messages to cell leaders.

pub mod actions;
pub mod automaton;
pub mod catalog;
pub mod chunk;
pub mod controller;
pub mod error;
pub mod ids;
pub mod mailbox;
pub mod messages;
pub mod notifications;
pub mod reshard;
pub mod table_replica;
pub mod tablet;
pub mod tablet_action;
pub mod tablet_cell;
pub mod tablet_cell_bundle;
pub mod tablet_owner;
pub mod types;

pub use actions::ActionSpec;
pub use automaton::{MasterAutomaton, MasterMutation, MasterResponse};
pub use catalog::{CatalogStreams, TabletCatalog};
pub use chunk::Chunk;
pub use controller::{CellTargets, TabletManager};
pub use error::{TabletError, TabletResult};
pub use ids::{
    ActionId, BundleId, CellId, ChunkId, DynamicStoreId, OwnerId, ReplicaId, TabletId,
    TransactionId,
};
pub use mailbox::{Mailbox, MailboxRegistry, OutboxMessage};
pub use messages::{CellNotification, CellRequest};
pub use table_replica::TableReplica;
pub use tablet::{Tablet, TabletReplicaInfo};
pub use tablet_action::TabletAction;
pub use tablet_cell::{CellStatistics, TabletCell};
pub use tablet_cell_bundle::TabletCellBundle;
pub use tablet_owner::TabletOwner;
pub use types::{
    ActionKind, ActionState, Atomicity, CellHealth, MountSettings, OwnerKind, PivotKey,
    ReplicaMode, ReplicaState, TabletState, UpdateMode,
};
