//! Appearance preset engine for non-player characters.
//!
//! This crate provides:
//! - Condition matching and scoring against character attributes
//! - Body morph and surface overlay presets loaded from JSON folders
//! - A catalog with asynchronous validation on an injected executor
//! - Per-character assignment, deferred until the engine is ready
//! - A compressed, versioned snapshot format for save files
//!
//! The game is reached only through the traits in [`host`], so the engine
//! runs the same against the real host or the in-memory [`testing::TestWorld`].
//!
//! # Quick Start
//!
//! ```ignore
//! use diverse_core::{
//!     AcceptAll, AssignmentStore, Catalog, EngineConfig, StoreDeps, TokioExecutor,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_json_file("diverse.json".as_ref())?;
//!     let executor = TokioExecutor::current().ok_or("no runtime")?;
//!
//!     // Phase one: the catalog.
//!     let catalog = Catalog::load(&config, Arc::new(AcceptAll), Arc::new(executor));
//!     let validation = catalog.validate_presets();
//!
//!     // Phase two: the store, wired to the catalog and the host.
//!     let deps = StoreDeps::new(host.actors(), host.capabilities());
//!     let store = AssignmentStore::new(catalog, deps);
//!     store.attach(host.lifecycle());
//!
//!     validation.await;
//!     store.restore(&host.read_save_record());
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod assignment;
pub mod catalog;
pub mod conditions;
pub mod config;
pub mod deferred;
pub mod events;
pub mod exclusions;
pub mod executor;
pub mod host;
pub mod persist;
pub mod preset;
pub mod selector;
pub mod store;
pub mod testing;
pub mod validation;

// Primary public API
pub use actor::{Actor, ActorSpec, FormId, FormRef, Gender};
pub use assignment::AssignmentSet;
pub use catalog::{Catalog, ValidationHandle, ValidationReport};
pub use conditions::{CoincidenceLevel, ConditionSet, Filter};
pub use config::{ConfigError, EngineConfig, MapConfig};
pub use deferred::DeferredQueue;
pub use events::{SubscriptionId, Subscribers};
pub use exclusions::ExclusionList;
pub use executor::{InlineExecutor, TaskExecutor, TokioExecutor};
pub use host::{
    ActorLookup, AllEligible, Capabilities, ConfigSource, Eligibility, Exclusion, LifecycleEvents,
    MorphApplier, OverlayApplier,
};
pub use persist::{PersistError, SnapshotRecord};
pub use preset::{Category, LoadError, Overlay, Payload, Preset};
pub use selector::Selector;
pub use store::{Activation, AssignmentStore, StoreDeps};
pub use testing::TestWorld;
pub use validation::{AcceptAll, FsOverlayValidator, OverlayValidator, StaticValidator};
