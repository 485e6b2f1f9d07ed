//! Resource manager core
//!
//! Vocabulary shared by the engine, resource-type plug-ins and transports:
//! the right algebra, the resource-type contract, request flags and
//! policies, identifiers and cookies, wire messages, the transport effect,
//! configuration and the unified error type.

pub mod config;
pub mod effects;
pub mod errors;
pub mod flags;
pub mod identifiers;
pub mod messages;
pub mod resource_type;
pub mod right;

pub use config::RmConfig;
pub use effects::RmTransport;
pub use errors::{errno, status_of, RmError, RmResult};
pub use flags::{IncomingFlags, PinFlag, Policy, Priority};
pub use identifiers::{
    Endpoint, GroupId, IncomingId, LoanCookie, LoanId, OutgoingId, OwnerCookie, OwnerId, PinId,
    ResourceTypeId, RightId,
};
pub use messages::{RmEnvelope, RmMessage, RmReply, RmRequest, WIRE_VERSION};
pub use resource_type::ResourceType;
pub use right::{join_all, Right};
