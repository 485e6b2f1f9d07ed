//! Remote owner proxies
//!
//! A `Remote` names an owner living in another domain: the endpoint of its
//! service plus the owner's cookie. Location happens lazily the first time
//! an outgoing request needs the remote, and again after a network failure
//! dropped the session.

use parking_lot::Mutex;
use rm_core::{
    Endpoint, OwnerCookie, ResourceTypeId, RmError, RmReply, RmRequest, RmResult, RmTransport,
};
use std::fmt;
use tracing::{debug, trace, warn};

/// Location progress of a remote owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteState {
    /// Nothing known beyond the endpoint
    Initialised,
    /// Session with the endpoint being established
    ServiceLocating,
    /// Session established
    ServiceLocated,
    /// Owner cookie being resolved
    OwnerLocating,
    /// Ready for requests
    OwnerLocated,
}

struct Location {
    state: RemoteState,
    cookie: Option<OwnerCookie>,
}

/// Handle to an owner in another address space
pub struct Remote {
    endpoint: Endpoint,
    resource_type: ResourceTypeId,
    resource: Vec<u8>,
    location: Mutex<Location>,
    setup: tokio::sync::Mutex<()>,
}

impl Remote {
    pub(crate) fn new(
        endpoint: Endpoint,
        resource_type: ResourceTypeId,
        resource: Vec<u8>,
        cookie: Option<OwnerCookie>,
    ) -> Self {
        Self {
            endpoint,
            resource_type,
            resource,
            location: Mutex::new(Location {
                state: RemoteState::Initialised,
                cookie,
            }),
            setup: tokio::sync::Mutex::new(()),
        }
    }

    /// Endpoint of the remote domain
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current location state
    pub fn state(&self) -> RemoteState {
        self.location.lock().state
    }

    /// Owner cookie, once known
    pub fn cookie(&self) -> Option<OwnerCookie> {
        self.location.lock().cookie
    }

    fn advance(&self, state: RemoteState) {
        self.location.lock().state = state;
        trace!(remote = %self.endpoint, ?state, "remote location advanced");
    }

    /// Forget the session after a network failure; a known cookie survives
    pub(crate) fn reset(&self) {
        self.location.lock().state = RemoteState::Initialised;
    }

    /// Bring the remote to `OwnerLocated` and return its cookie.
    ///
    /// Concurrent callers queue behind the first one, so a request racing
    /// session setup waits for it instead of being sent early.
    pub(crate) async fn locate(&self, transport: &dyn RmTransport) -> RmResult<OwnerCookie> {
        let _setup = self.setup.lock().await;
        {
            let location = self.location.lock();
            if let (RemoteState::OwnerLocated, Some(cookie)) = (location.state, location.cookie) {
                return Ok(cookie);
            }
        }
        let located = self.establish(transport).await;
        if let Err(err) = &located {
            warn!(remote = %self.endpoint, error = %err, "remote location failed");
            self.reset();
        }
        located
    }

    async fn establish(&self, transport: &dyn RmTransport) -> RmResult<OwnerCookie> {
        self.advance(RemoteState::ServiceLocating);
        transport.connect(&self.endpoint).await?;
        self.advance(RemoteState::ServiceLocated);

        self.advance(RemoteState::OwnerLocating);
        let cookie = match self.cookie() {
            Some(cookie) => cookie,
            None => {
                let request = RmRequest::Locate {
                    resource_type: self.resource_type,
                    resource: self.resource.clone(),
                };
                match transport.request(&self.endpoint, request).await? {
                    RmReply::Located { owner } => owner,
                    other => {
                        return Err(RmError::protocol(format!(
                            "locate answered with {other:?}"
                        )))
                    }
                }
            }
        };

        let mut location = self.location.lock();
        location.cookie = Some(cookie);
        location.state = RemoteState::OwnerLocated;
        debug!(remote = %self.endpoint, owner = %cookie, "remote owner located");
        Ok(cookie)
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = self.location.lock();
        f.debug_struct("Remote")
            .field("endpoint", &self.endpoint)
            .field("state", &location.state)
            .field("cookie", &location.cookie)
            .finish()
    }
}
