//! Outgoing dispatch
//!
//! One task per outgoing request. It brings the remote to `OwnerLocated`,
//! claims the request's `sent` flag under the group lock, transmits it and
//! hands the reply back to the owner. The whole exchange runs under the
//! configured outgoing deadline; nothing is retried.

use crate::resource::TypeInner;
use crate::remote::Remote;
use rm_core::{OutgoingId, OwnerId, ResourceType, RmError, RmReply, RmResult};
use std::sync::Arc;
use tracing::warn;

pub(crate) async fn run<T: ResourceType>(
    inner: Arc<TypeInner<T>>,
    owner: OwnerId,
    outgoing: OutgoingId,
) {
    let remote = inner.run(|_, group, _| {
        group
            .owner(owner)
            .ok()
            .and_then(|owner| owner.outgoing_remote(outgoing))
    });
    let Some(remote) = remote else {
        return;
    };

    let deadline = inner.config.outgoing_timeout();
    let exchanged = exchange(&inner, &remote, owner, outgoing);
    let result = match tokio::time::timeout(deadline, exchanged).await {
        Ok(result) => result,
        Err(_) => Err(RmError::timeout(format!(
            "{outgoing} unanswered after {}ms",
            deadline.as_millis()
        ))),
    };
    if let Err(err) = &result {
        warn!(%owner, %outgoing, remote = %remote.endpoint(), error = %err, "dispatch failed");
        if matches!(err, RmError::Network { .. } | RmError::Timeout { .. }) {
            remote.reset();
        }
    }
    inner.run(|ctx, group, fx| group.deliver(ctx, owner, outgoing, result, fx));
}

async fn exchange<T: ResourceType>(
    inner: &Arc<TypeInner<T>>,
    remote: &Remote,
    owner: OwnerId,
    outgoing: OutgoingId,
) -> RmResult<RmReply> {
    let target = remote.locate(inner.transport.as_ref()).await?;
    let request = inner.run(|ctx, group, _| {
        group
            .owner_mut(owner)?
            .prepare_send(ctx, outgoing, target)
    })?;
    inner.transport.request(remote.endpoint(), request).await
}
