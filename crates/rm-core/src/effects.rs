//! Transport effect
//!
//! The engine reaches other domains only through this trait. An
//! implementation establishes sessions and delivers exactly one completion
//! (reply or error) per request; ordering is only guaranteed within a
//! single session. Deadlines are applied by the caller.

use crate::errors::RmResult;
use crate::identifiers::Endpoint;
use crate::messages::{RmReply, RmRequest};
use async_trait::async_trait;

/// Request/reply transport between resource domains
#[async_trait]
pub trait RmTransport: Send + Sync {
    /// Bring up a session with the domain at `endpoint`
    async fn connect(&self, endpoint: &Endpoint) -> RmResult<()>;

    /// Send a request over an established session and wait for its reply.
    ///
    /// A remote failure comes back as the error the remote produced.
    async fn request(&self, endpoint: &Endpoint, request: RmRequest) -> RmResult<RmReply>;
}
