#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! Integration bus between a reasoning/template subsystem and a
//! field-dynamics subsystem: typed message envelopes, bounded priority
//! queues, payload validation and schema adaptation, a dual-channel
//! bridge with state synchronization, and a processing controller.

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod message;
pub mod metrics;
pub mod observability;
pub mod queue;

pub use adapter::{SchemaAdapter, ValidationResult};
pub use bridge::{Bridge, BridgeStatus, HealthState, SubsystemChannel, SyncResult};
pub use config::{BusConfig, ChannelEndpoint, ChannelsConfig};
pub use controller::{Controller, FnHandler, HandlerReport, MessageHandler};
pub use error::BusError;
pub use message::{
    AckStatus, Acknowledgment, Message, MessageContext, MessageType, Payload, Priority, Subsystem,
};
pub use metrics::MetricsSnapshot;
