//! Typed CRUD repositories with change notification over a hierarchical
//! coordination store.
//!
//! A [`Repository`] maps domain objects to the children of one namespace
//! node: each item lives at `root/<decimal id>` with its encoded bytes as
//! the payload. Reads and writes go straight to the store; registered
//! callbacks fire whenever the set of children changes.
//!
//! Suited to small, in-memory-sized collections that need push
//! notification without a database. There is no referential integrity
//! across repositories and no multi-item transaction.
//!
//! # Modules
//!
//! - [`item`]: the [`RepositoryItem`] contract and [`ItemLookup`]
//! - [`codec`]: [`JsonCodec`] (default) and [`BincodeCodec`]
//! - [`repository`]: the [`Repository`] itself
//! - [`notifier`]: watch-event classification and callback dispatch
//! - [`config`]: [`RepositoryConfig`], loadable from TOML
//! - [`error`]: [`RepoError`] and friends
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use noderepo::{
//!     InMemoryStore, ItemId, ItemLookup, JsonCodec, Repository, RepositoryConfig,
//!     RepositoryItem, StoreConfig, ValidationError,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Car {
//!     id: u64,
//!     model: String,
//!     color: String,
//! }
//!
//! impl RepositoryItem for Car {
//!     type Codec = JsonCodec;
//!
//!     fn id(&self) -> ItemId {
//!         self.id
//!     }
//!
//!     fn validate(&self, _repository: &dyn ItemLookup<Self>) -> Result<(), ValidationError> {
//!         if self.model.is_empty() {
//!             return Err(ValidationError::new("car model is empty"));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let store = InMemoryStore::new("memory:cars");
//! let config = RepositoryConfig::new("/apps_root/cars", StoreConfig::with_address("memory:cars"));
//! let cars: Repository<Car, _> = Repository::new(store, config).unwrap();
//! cars.init_root().unwrap();
//! cars.open().unwrap();
//!
//! let changes = Arc::new(AtomicUsize::new(0));
//! let seen = Arc::clone(&changes);
//! cars.register_change_callback(move || {
//!     seen.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! let mut ferrari = Car { id: 1, model: "Ferrari".into(), color: "Red".into() };
//! cars.add(&ferrari).unwrap();
//! assert_eq!(cars.get(1).unwrap(), ferrari);
//!
//! ferrari.color = "Gold".into();
//! cars.update(&ferrari).unwrap();
//! assert_eq!(cars.snapshot().unwrap()[&1].color, "Gold");
//!
//! cars.remove(1).unwrap();
//! assert!(cars.snapshot().unwrap().is_empty());
//! cars.close().unwrap();
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod item;
pub mod notifier;
pub mod repository;

pub use codec::{BincodeCodec, ItemCodec, JsonCodec};
pub use config::RepositoryConfig;
pub use error::{CodecError, ConfigError, RepoError, RepoResult, ValidationError};
pub use item::{ItemId, ItemLookup, RepositoryItem};
pub use notifier::{qualifies, CallbackRegistry, ChangeCallback, ChangeEvent, ChangeNotifier};
pub use repository::Repository;

pub use noderepo_store as store;
pub use noderepo_store::{InMemoryStore, StoreConfig, StoreConnector};
