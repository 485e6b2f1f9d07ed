//! Server side of the borrow/revoke/cancel protocol

use crate::domain::TypeService;
use crate::resource::TypeInner;
use async_trait::async_trait;
use rm_core::{ResourceType, RmError, RmReply, RmRequest, RmResult};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Await the reply of a remote incoming request
async fn replied(receiver: oneshot::Receiver<RmResult<RmReply>>) -> RmResult<RmReply> {
    receiver
        .await
        .map_err(|_| RmError::shutdown("owner went away before replying"))?
}

#[async_trait]
impl<T: ResourceType> TypeService for TypeInner<T> {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn name(&self) -> &str {
        self.rtype.name()
    }

    fn is_idle(&self) -> bool {
        self.is_unowned()
    }

    async fn serve(self: Arc<Self>, request: RmRequest) -> RmResult<RmReply> {
        match request {
            RmRequest::Borrow {
                creditor,
                debtor,
                debtor_endpoint,
                flags,
                policy,
                group: credit,
                right,
                ..
            } => {
                let want = self.rtype.decode_right(&right)?;
                let receiver = self.run(|ctx, group, fx| {
                    group.accept_borrow(
                        ctx,
                        creditor,
                        debtor,
                        debtor_endpoint,
                        want,
                        flags,
                        policy,
                        credit,
                        fx,
                    )
                })?;
                replied(receiver).await
            }
            RmRequest::Revoke {
                debtor,
                loan,
                flags,
                right,
                ..
            } => {
                let want = self.rtype.decode_right(&right)?;
                let receiver = self.run(|ctx, group, fx| {
                    group.accept_revoke(ctx, debtor, loan, want, flags, fx)
                })?;
                replied(receiver).await
            }
            RmRequest::Cancel { creditor, loan, .. } => {
                self.run(|ctx, group, fx| group.accept_cancel(ctx, creditor, loan, fx))
            }
            RmRequest::Locate { resource, .. } => {
                let id = self.rtype.decode_id(&resource)?;
                let owner = self.run(|_, group, _| group.locate(&id))?;
                Ok(RmReply::Located { owner })
            }
        }
    }
}
