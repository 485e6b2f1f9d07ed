//! In-memory network of resource domains
//!
//! Every request crosses the wire format: it is wrapped in an
//! [`RmEnvelope`], encoded, decoded and handed to the target domain, and
//! the reply travels back the same way. Endpoints can be partitioned
//! (sessions fail) or stalled (requests never complete) to exercise
//! failure paths.

use async_trait::async_trait;
use rm_core::{
    Endpoint, RmConfig, RmEnvelope, RmError, RmMessage, RmReply, RmRequest, RmResult, RmTransport,
};
use rm_engine::ResourceDomain;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct NetworkInner {
    domains: RwLock<HashMap<Endpoint, ResourceDomain>>,
    partitioned: RwLock<HashSet<Endpoint>>,
    stalled: RwLock<HashSet<Endpoint>>,
    next_id: AtomicU64,
}

/// Domains reachable from each other by endpoint
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Empty network with no endpoints
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport attached to this network
    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: Arc::downgrade(&self.inner),
        })
    }

    /// Create a domain at `endpoint` and make it reachable
    pub async fn add_domain(
        &self,
        endpoint: impl Into<Endpoint>,
        config: RmConfig,
    ) -> RmResult<ResourceDomain> {
        let endpoint = endpoint.into();
        let domain = ResourceDomain::new(endpoint.clone(), config, self.transport())?;
        self.inner
            .domains
            .write()
            .await
            .insert(endpoint, domain.clone());
        Ok(domain)
    }

    /// Fail every session setup toward `endpoint`
    pub async fn partition(&self, endpoint: impl Into<Endpoint>) {
        self.inner.partitioned.write().await.insert(endpoint.into());
    }

    /// Undo [`MemoryNetwork::partition`]
    pub async fn heal(&self, endpoint: impl Into<Endpoint>) {
        self.inner.partitioned.write().await.remove(&endpoint.into());
    }

    /// Swallow every request sent to `endpoint`
    pub async fn stall(&self, endpoint: impl Into<Endpoint>) {
        self.inner.stalled.write().await.insert(endpoint.into());
    }

    /// Deliver requests to `endpoint` again
    pub async fn resume(&self, endpoint: impl Into<Endpoint>) {
        self.inner.stalled.write().await.remove(&endpoint.into());
    }
}

/// [`RmTransport`] over a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: Weak<NetworkInner>,
}

impl MemoryTransport {
    fn network(&self) -> RmResult<Arc<NetworkInner>> {
        self.network
            .upgrade()
            .ok_or_else(|| RmError::network("memory network shut down"))
    }
}

#[async_trait]
impl RmTransport for MemoryTransport {
    async fn connect(&self, endpoint: &Endpoint) -> RmResult<()> {
        let network = self.network()?;
        if network.partitioned.read().await.contains(endpoint) {
            return Err(RmError::network(format!("{endpoint} is partitioned")));
        }
        if !network.domains.read().await.contains_key(endpoint) {
            return Err(RmError::network(format!("no domain at {endpoint}")));
        }
        Ok(())
    }

    async fn request(&self, endpoint: &Endpoint, request: RmRequest) -> RmResult<RmReply> {
        let network = self.network()?;
        if network.partitioned.read().await.contains(endpoint) {
            return Err(RmError::network(format!("{endpoint} is partitioned")));
        }
        if network.stalled.read().await.contains(endpoint) {
            debug!(%endpoint, kind = request.kind(), "request swallowed");
            return futures::future::pending().await;
        }
        let domain = network
            .domains
            .read()
            .await
            .get(endpoint)
            .cloned()
            .ok_or_else(|| RmError::network(format!("no domain at {endpoint}")))?;

        let id = network.next_id.fetch_add(1, Ordering::Relaxed);
        let wire = RmEnvelope::new(RmMessage::Request { id, request }).encode()?;
        let RmMessage::Request { request, .. } = RmEnvelope::decode(&wire)?.message else {
            return Err(RmError::protocol("reply arrived where a request was expected"));
        };

        let result = domain.handle(request).await;
        let wire = RmEnvelope::new(RmMessage::Reply { id, result }).encode()?;
        match RmEnvelope::decode(&wire)?.message {
            RmMessage::Reply { id: replied, result } if replied == id => result,
            other => Err(RmError::protocol(format!("unexpected message {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rm_core::{OwnerCookie, ResourceTypeId};
    use std::time::Duration;

    fn locate() -> RmRequest {
        RmRequest::Locate {
            resource_type: ResourceTypeId(1),
            resource: vec![1],
        }
    }

    #[tokio::test]
    async fn test_connect_needs_a_domain() {
        let network = MemoryNetwork::new();
        let transport = network.transport();
        let err = transport.connect(&Endpoint::from("nowhere")).await.unwrap_err();
        assert_matches!(err, RmError::Network { .. });

        network.add_domain("here", RmConfig::testing()).await.unwrap();
        transport.connect(&Endpoint::from("here")).await.unwrap();
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let network = MemoryNetwork::new();
        network.add_domain("here", RmConfig::testing()).await.unwrap();
        let transport = network.transport();
        let here = Endpoint::from("here");

        network.partition("here").await;
        assert_matches!(transport.connect(&here).await, Err(RmError::Network { .. }));
        assert_matches!(transport.request(&here, locate()).await, Err(RmError::Network { .. }));

        network.heal("here").await;
        transport.connect(&here).await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_reach_the_domain_through_the_wire() {
        let network = MemoryNetwork::new();
        network.add_domain("here", RmConfig::testing()).await.unwrap();
        let transport = network.transport();

        // No type registered, so the domain itself rejects the request.
        let err = transport
            .request(&Endpoint::from("here"), locate())
            .await
            .unwrap_err();
        assert_matches!(err, RmError::Protocol { .. });

        let cancel = RmRequest::Cancel {
            resource_type: ResourceTypeId(1),
            creditor: OwnerCookie::new(),
            loan: rm_core::LoanCookie::new(),
        };
        assert_matches!(
            transport.request(&Endpoint::from("here"), cancel).await,
            Err(RmError::Protocol { .. })
        );
    }

    #[tokio::test]
    async fn test_stalled_endpoint_never_answers() {
        let network = MemoryNetwork::new();
        network.add_domain("here", RmConfig::testing()).await.unwrap();
        let transport = network.transport();
        network.stall("here").await;

        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            transport.request(&Endpoint::from("here"), locate()),
        )
        .await;
        assert!(pending.is_err());

        network.resume("here").await;
        assert_matches!(
            transport.request(&Endpoint::from("here"), locate()).await,
            Err(RmError::Protocol { .. })
        );
    }

    #[tokio::test]
    async fn test_transport_outliving_network_fails() {
        let transport = MemoryNetwork::new().transport();
        assert_matches!(
            transport.connect(&Endpoint::from("here")).await,
            Err(RmError::Network { .. })
        );
    }
}
