//! # tether-core
//!
//! Shared vocabulary for the tether state-synchronization layer.
//!
//! - **Handles**: [`FactKey`], [`SubscriberId`], [`HandlerId`], [`BridgeId`],
//!   [`ConnectionId`] as process-unique numeric newtypes
//! - **Facts**: [`FactValue`] shared JSON payloads compared by identity
//! - **Hub**: [`Hub`] keyed fact store with replay-on-subscribe
//! - **Codec**: newline-delimited `[kind, body]` frames with a buffering decoder
//! - **Lock**: fact-based mutual exclusion ([`lock::lock_enter`], [`lock::LockArbiter`])
//! - **Projects**: presence facts and [`projects::wait_for_projects`]
//! - **Errors**: [`ConnectionError`] transport failure taxonomy

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod hub;
pub mod ids;
pub mod lock;
pub mod logging;
pub mod projects;
pub mod value;

pub use codec::{Frame, FrameDecoder, FrameKind};
pub use errors::ConnectionError;
pub use hub::{FactEvent, Hub, Subscription};
pub use ids::{BridgeId, ConnectionId, FactKey, HandlerId, SubscriberId};
pub use value::FactValue;
