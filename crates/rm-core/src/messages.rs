//! Wire messages exchanged between resource domains
//!
//! Rights and resource identities travel as opaque byte buffers produced by
//! the resource type. Owners and loans are named by cookies only.

use crate::errors::{RmError, RmResult};
use crate::flags::{IncomingFlags, Policy};
use crate::identifiers::{Endpoint, GroupId, LoanCookie, OwnerCookie, ResourceTypeId};
use serde::{Deserialize, Serialize};

/// Current envelope version
pub const WIRE_VERSION: u8 = 1;

/// Request sent to a remote owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RmRequest {
    /// Ask a creditor to lend a right
    Borrow {
        /// Type of the resource
        resource_type: ResourceTypeId,
        /// Creditor owner asked for the right
        creditor: OwnerCookie,
        /// Owner that will hold the loan
        debtor: OwnerCookie,
        /// Where the debtor can be reached for revocation
        debtor_endpoint: Endpoint,
        /// Flags of the request that caused the borrow
        flags: IncomingFlags,
        /// Policy the creditor applies when granting
        policy: Policy,
        /// Credit group the debtor borrows under
        group: GroupId,
        /// Encoded wanted right
        right: Vec<u8>,
    },
    /// Ask a debtor to return part of a loan
    Revoke {
        /// Type of the resource
        resource_type: ResourceTypeId,
        /// Debtor owner holding the loan
        debtor: OwnerCookie,
        /// Loan being revoked
        loan: LoanCookie,
        /// Flags of the request that caused the revocation
        flags: IncomingFlags,
        /// Encoded right to return
        right: Vec<u8>,
    },
    /// Return a borrowed loan without being asked
    Cancel {
        /// Type of the resource
        resource_type: ResourceTypeId,
        /// Creditor owner that lent the loan
        creditor: OwnerCookie,
        /// Loan being returned
        loan: LoanCookie,
    },
    /// Find the owner serving a resource at an endpoint
    Locate {
        /// Type of the resource
        resource_type: ResourceTypeId,
        /// Encoded resource identity
        resource: Vec<u8>,
    },
}

impl RmRequest {
    /// Resource type the request is routed by
    pub fn resource_type(&self) -> ResourceTypeId {
        match self {
            Self::Borrow { resource_type, .. }
            | Self::Revoke { resource_type, .. }
            | Self::Cancel { resource_type, .. }
            | Self::Locate { resource_type, .. } => *resource_type,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Borrow { .. } => "borrow",
            Self::Revoke { .. } => "revoke",
            Self::Cancel { .. } => "cancel",
            Self::Locate { .. } => "locate",
        }
    }
}

/// Successful reply to an `RmRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RmReply {
    /// The right was lent under a new loan
    Borrowed {
        /// Cookie of the new loan
        loan: LoanCookie,
        /// Encoded granted right
        right: Vec<u8>,
    },
    /// The revoked right was returned
    Revoked,
    /// The cancelled loan was accepted back
    Cancelled,
    /// The owner serving the resource
    Located {
        /// Cookie of the located owner
        owner: OwnerCookie,
    },
}

/// Body of an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RmMessage {
    /// A request with its correlation id
    Request {
        /// Correlation id chosen by the sender
        id: u64,
        /// The request itself
        request: RmRequest,
    },
    /// A reply correlated to a request
    Reply {
        /// Correlation id of the request
        id: u64,
        /// Reply or remote failure
        result: Result<RmReply, RmError>,
    },
}

/// Versioned envelope carried by a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmEnvelope {
    /// Wire version
    pub version: u8,
    /// Message body
    pub message: RmMessage,
}

impl RmEnvelope {
    /// Wrap a message in a current-version envelope
    pub fn new(message: RmMessage) -> Self {
        Self {
            version: WIRE_VERSION,
            message,
        }
    }

    /// Encode into bytes
    pub fn encode(&self) -> RmResult<Vec<u8>> {
        bincode::serialize(self).map_err(RmError::from)
    }

    /// Decode from bytes, rejecting unknown versions
    pub fn decode(bytes: &[u8]) -> RmResult<Self> {
        let envelope: Self = bincode::deserialize(bytes)?;
        if envelope.version != WIRE_VERSION {
            return Err(RmError::protocol(format!(
                "unsupported wire version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn borrow() -> RmRequest {
        RmRequest::Borrow {
            resource_type: ResourceTypeId(1),
            creditor: OwnerCookie::new(),
            debtor: OwnerCookie::new(),
            debtor_endpoint: Endpoint::from("s1"),
            flags: IncomingFlags::MAY_BORROW,
            policy: Policy::Strict,
            group: GroupId(4),
            right: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = RmEnvelope::new(RmMessage::Request {
            id: 9,
            request: borrow(),
        });
        let bytes = envelope.encode().unwrap();
        assert_eq!(RmEnvelope::decode(&bytes).unwrap(), envelope);

        let reply = RmEnvelope::new(RmMessage::Reply {
            id: 9,
            result: Err(RmError::busy("held")),
        });
        let bytes = reply.encode().unwrap();
        assert_eq!(RmEnvelope::decode(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut envelope = RmEnvelope::new(RmMessage::Reply {
            id: 1,
            result: Ok(RmReply::Revoked),
        });
        envelope.version = 42;
        let bytes = envelope.encode().unwrap();
        assert_matches!(RmEnvelope::decode(&bytes), Err(RmError::Protocol { .. }));
    }

    #[test]
    fn test_request_routing_fields() {
        let request = borrow();
        assert_eq!(request.resource_type(), ResourceTypeId(1));
        assert_eq!(request.kind(), "borrow");
    }
}
