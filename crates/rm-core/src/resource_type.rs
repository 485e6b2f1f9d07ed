//! Resource-type plug-in contract
//!
//! A resource type supplies the right payload, the identity of its
//! resources and the hooks the engine calls at the edges: validation of a
//! wanted right, (de)serialisation of rights and resource identities for
//! messages, and resolution of custom grant policies.

use crate::errors::{RmError, RmResult};
use crate::identifiers::ResourceTypeId;
use crate::right::Right;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;

/// Behaviour shared by every resource of one type
pub trait ResourceType: Send + Sync + 'static {
    /// Right payload of this type
    type Right: Right;

    /// Identity of one resource of this type
    type Id: Clone + Debug + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Registered type tag, unique inside a domain
    fn type_id(&self) -> ResourceTypeId;

    /// Human readable type name
    fn name(&self) -> &str;

    /// Reject rights the type cannot represent
    fn validate(&self, _right: &Self::Right) -> RmResult<()> {
        Ok(())
    }

    /// Serialise a right for a message
    fn encode_right(&self, right: &Self::Right) -> RmResult<Vec<u8>> {
        right.encode()
    }

    /// Parse a right out of a message; failures are not representable
    fn decode_right(&self, bytes: &[u8]) -> RmResult<Self::Right> {
        let right = Self::Right::decode(bytes)?;
        self.validate(&right)?;
        Ok(right)
    }

    /// Serialise a resource identity for a location request
    fn encode_id(&self, id: &Self::Id) -> RmResult<Vec<u8>> {
        bincode::serialize(id).map_err(RmError::from)
    }

    /// Parse a resource identity out of a location request
    fn decode_id(&self, bytes: &[u8]) -> RmResult<Self::Id> {
        bincode::deserialize(bytes).map_err(|err| RmError::protocol(err.to_string()))
    }

    /// Pick the right granted under `Policy::Custom(code)`.
    ///
    /// `need` is the part of the wanted right that must come from `cached`,
    /// the join of the cached rights not conflicting with held ones. The
    /// returned right must contain `need` and lie within `cached`.
    fn apply_policy(
        &self,
        code: u32,
        _need: &Self::Right,
        _cached: &Self::Right,
    ) -> RmResult<Self::Right> {
        Err(RmError::invalid(format!(
            "{} has no custom policy {code}",
            self.name()
        )))
    }
}
