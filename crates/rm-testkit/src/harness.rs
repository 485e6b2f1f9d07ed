//! Three-server scenario harness
//!
//! Three domains `s1`, `s2`, `s3` on one [`MemoryNetwork`], each with one
//! owner of rings resource 1. The owners form a creditor chain
//! `s1 -> s2 -> s3`, or a fan where `s1` and `s2` both borrow from `s3`;
//! `s3` is seeded with the capital and owes nobody.

use crate::network::MemoryNetwork;
use crate::rings::{Rings, RingsType};
use parking_lot::Mutex;
use rm_core::{IncomingFlags, IncomingId, Right, RmConfig, RmResult};
use rm_engine::{
    IncomingHandle, IncomingOps, IncomingStatus, OwnerHandle, OwnerSnapshot, RequestOptions,
    Resource, ResourceDomain, ResourceTypeHandle,
};
use std::sync::Arc;
use tokio::sync::Notify;

/// Resource id every harness owner works on
pub const RESOURCE: u64 = 1;

/// One domain with its rings owner
pub struct Server {
    /// Endpoint of the domain
    pub name: &'static str,
    /// The domain itself
    pub domain: ResourceDomain,
    /// Registered rings type
    pub rtype: ResourceTypeHandle<RingsType>,
    /// Resource [`RESOURCE`]
    pub resource: Resource<RingsType>,
    /// Owner of the resource
    pub owner: OwnerHandle<RingsType>,
}

impl Server {
    async fn start(
        network: &MemoryNetwork,
        name: &'static str,
        creditor: Option<&str>,
        config: RmConfig,
    ) -> Self {
        let domain = network.add_domain(name, config).await.unwrap();
        let rtype = domain.register_type(RingsType).unwrap();
        let resource = rtype.resource(RESOURCE).unwrap();
        let creditor = creditor.map(|endpoint| resource.remote(endpoint).unwrap());
        let owner = rtype.owner(&resource, creditor).unwrap();
        Self {
            name,
            domain,
            rtype,
            resource,
            owner,
        }
    }

    /// Submit a request without callbacks
    pub fn get(&self, want: Rings, flags: IncomingFlags) -> IncomingHandle<RingsType> {
        self.owner.request(want, RequestOptions::new(flags), None).unwrap()
    }

    /// Submit a request and wait until it settles
    pub async fn get_and_wait(
        &self,
        want: Rings,
        flags: IncomingFlags,
    ) -> (IncomingHandle<RingsType>, IncomingStatus) {
        let handle = self.get(want, flags);
        let status = handle.wait().await;
        (handle, status)
    }

    /// Owner books; panics if the owner is gone
    pub fn snapshot(&self) -> OwnerSnapshot<Rings> {
        self.owner.snapshot().unwrap()
    }

    /// Held and cached rings
    pub fn owned(&self) -> Rings {
        let books = self.snapshot();
        books.held_join().join(&books.cached_join())
    }
}

/// Three servers, `s3` at the top
pub struct ThreeServers {
    /// Network joining the three domains
    pub network: MemoryNetwork,
    /// Bottom of the chain, borrowing from `s2`, or from `s3` in a fan
    pub s1: Server,
    /// Borrowing from `s3`
    pub s2: Server,
    /// Top, seeded with the capital
    pub s3: Server,
}

impl ThreeServers {
    /// Chain with `capital` seeded at `s3`
    pub async fn new(capital: Rings) -> Self {
        Self::with_config(capital, RmConfig::testing()).await
    }

    /// Chain whose domains all use `config`
    pub async fn with_config(capital: Rings, config: RmConfig) -> Self {
        let network = MemoryNetwork::new();
        let s3 = Server::start(&network, "s3", None, config.clone()).await;
        let s2 = Server::start(&network, "s2", Some("s3"), config.clone()).await;
        let s1 = Server::start(&network, "s1", Some("s2"), config).await;
        s3.owner.self_add(capital).unwrap();
        Self { network, s1, s2, s3 }
    }

    /// Fan with `s1` and `s2` both debtors of `s3`, seeded with `capital`
    pub async fn fan(capital: Rings) -> Self {
        let network = MemoryNetwork::new();
        let config = RmConfig::testing();
        let s3 = Server::start(&network, "s3", None, config.clone()).await;
        let s2 = Server::start(&network, "s2", Some("s3"), config.clone()).await;
        let s1 = Server::start(&network, "s1", Some("s3"), config).await;
        s3.owner.self_add(capital).unwrap();
        Self { network, s1, s2, s3 }
    }

    /// Servers from the bottom of the chain up
    pub fn servers(&self) -> [&Server; 3] {
        [&self.s1, &self.s2, &self.s3]
    }

    /// Every owner's books balance and no right is owned twice
    pub fn check_invariants(&self) -> Result<(), String> {
        for server in self.servers() {
            if !server.owner.is_balanced().map_err(|err| err.to_string())? {
                let books = server.snapshot();
                return Err(format!("{} books out of balance: {books:?}", server.name));
            }
        }
        let owned: Vec<(&str, Rings)> = self
            .servers()
            .iter()
            .map(|server| (server.name, server.owned()))
            .collect();
        for (i, (left, a)) in owned.iter().enumerate() {
            for (right, b) in &owned[i + 1..] {
                if a.intersects(b) {
                    return Err(format!("{left} and {right} both own {:?}", a.meet(b)));
                }
            }
        }
        Ok(())
    }
}

/// Caller callbacks that record what happened
#[derive(Default)]
pub struct RecordingOps {
    completed: Mutex<Vec<(IncomingId, i32)>>,
    conflicts: Mutex<Vec<IncomingId>>,
    notify: Notify,
}

impl RecordingOps {
    /// Fresh recorder, ready to hand to a request
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Completed requests with their status codes
    pub fn completions(&self) -> Vec<(IncomingId, i32)> {
        self.completed.lock().clone()
    }

    /// Held requests told about a conflict
    pub fn conflicts(&self) -> Vec<IncomingId> {
        self.conflicts.lock().clone()
    }

    /// Wait for the first conflict notification
    pub async fn wait_conflict(&self) -> IncomingId {
        loop {
            if let Some(id) = self.conflicts.lock().first().copied() {
                return id;
            }
            self.notify.notified().await;
        }
    }
}

impl IncomingOps for RecordingOps {
    fn on_complete(&self, id: IncomingId, result: &RmResult<()>) {
        self.completed.lock().push((id, rm_core::status_of(result)));
        self.notify.notify_one();
    }

    fn on_conflict(&self, id: IncomingId) {
        self.conflicts.lock().push(id);
        self.notify.notify_one();
    }
}
