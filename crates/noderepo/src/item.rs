//! The contract a domain type implements to be stored in a repository.

use std::collections::BTreeMap;

use crate::codec::ItemCodec;
use crate::error::{CodecError, RepoResult, ValidationError};

/// Identifier of an item, unique within one repository. Its decimal form is
/// the name of the item's node.
pub type ItemId = u64;

/// Read-only view of a repository, handed to [`RepositoryItem::validate`]
/// so an item can be checked against what is currently stored.
pub trait ItemLookup<T> {
    fn get(&self, id: ItemId) -> RepoResult<T>;
    fn contains(&self, id: ItemId) -> RepoResult<bool>;
    fn snapshot(&self) -> RepoResult<BTreeMap<ItemId, T>>;
}

/// A domain object persisted as one node under a repository root.
///
/// # Example
///
/// ```
/// use noderepo::{ItemId, ItemLookup, JsonCodec, RepositoryItem, ValidationError};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Car {
///     id: u64,
///     model: String,
/// }
///
/// impl RepositoryItem for Car {
///     type Codec = JsonCodec;
///
///     fn id(&self) -> ItemId {
///         self.id
///     }
///
///     fn validate(&self, _repository: &dyn ItemLookup<Self>) -> Result<(), ValidationError> {
///         if self.model.is_empty() {
///             return Err(ValidationError::new("car model is empty"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait RepositoryItem: Sized + Send + Sync + 'static {
    /// Encoding used for the node payload.
    type Codec: ItemCodec<Self>;

    fn id(&self) -> ItemId;

    /// Check the item before `add` and `update`. Most types ignore
    /// `repository`; it is there for cross-checks against stored items.
    fn validate(&self, repository: &dyn ItemLookup<Self>) -> Result<(), ValidationError>;

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        <Self::Codec as ItemCodec<Self>>::encode(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        <Self::Codec as ItemCodec<Self>>::decode(bytes)
    }
}

/// Parse a node name back into an item id.
///
/// Only the canonical decimal form is accepted, so `"7"` parses but `"07"`
/// and `"+7"` do not: those can only come from a foreign writer.
pub fn parse_node_name(name: &str) -> Option<ItemId> {
    let id: ItemId = name.parse().ok()?;
    (id.to_string() == name).then_some(id)
}
