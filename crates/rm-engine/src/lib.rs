//! Resource manager engine
//!
//! Owners of a resource keep books of rights they hold, cache, borrowed
//! from a creditor owner and lent to debtor owners. Local callers ask an
//! owner for rights; the owner grants them from its books, waits for
//! conflicting holders, revokes what it sublet, or borrows from upstream.
//! Owners in other domains are reached through the [`RmTransport`]
//! effect, and their requests enter through [`ResourceDomain::handle`].
//!
//! All owners of one resource type share one lock. Nothing blocks or
//! awaits while it is held: callbacks and network work are applied after
//! release.
//!
//! [`RmTransport`]: rm_core::RmTransport

mod dispatch;
mod domain;
mod group;
mod handle;
mod incoming;
mod loan;
mod outgoing;
mod owner;
mod pin;
mod remote;
mod resource;
mod service;

pub use domain::ResourceDomain;
pub use handle::{IncomingHandle, OwnerHandle, RequestOptions};
pub use incoming::{IncomingOps, IncomingState, IncomingStatus};
pub use owner::{OwnerSnapshot, OwnerState};
pub use remote::{Remote, RemoteState};
pub use resource::{Resource, ResourceTypeHandle};

pub use rm_core;
