//! # pipehub: control plane for a distributed dataflow pipeline
//!
//! A session consists of one master hub, optional slave hubs, user
//! interfaces and compute modules. Modules exchange data as shared objects
//! living in a per-node [`object::SharedRegion`]; everything else travels as
//! fixed-size control messages.
//!
//! ## Architecture
//!
//! ```text
//!   UI ◀──────▶ master hub ◀──────▶ slave hub ◀──▶ UI
//!                  │  │                  │
//!          StateTracker  Router    StateTracker
//!                  │                     │
//!               manager               manager
//!                  │                     │
//!            modules (Module::run)   modules
//!                  └──── shared objects / archives ────┘
//! ```
//!
//! - **object**: typed shared arrays and reference-counted data objects
//! - **archive**: deep serialization of objects and arrays, with deferred
//!   fetching of missing dependencies
//! - **message**: fixed-size envelopes, payloads and framing
//! - **router**: per-type routing table and forwarding predicates
//! - **tracker**: mirror of session state, replayable to late joiners
//! - **module**: the dispatch loop a compute module runs
//! - **hub**: message dispatch inside a hub process
//!
//! ## Example
//!
//! ```ignore
//! use pipehub::module::{Compute, Module, Task};
//!
//! struct Passthrough;
//!
//! impl Compute for Passthrough {
//!     fn compute(&mut self, module: &mut Module, _task: &Task) -> pipehub::Result<()> {
//!         while let Some(obj) = module.take_input("data_in") {
//!             module.add_object("data_out", &obj)?;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod hub;
pub mod id;
pub mod message;
pub mod module;
pub mod object;
pub mod parameter;
pub mod router;
pub mod tracker;
pub mod transport;

// Re-export commonly used types
pub use config::HubConfig;
pub use error::{PipehubError, Result};
pub use id::{Id, Identity};
pub use message::{Message, MessageFactory, MessageType, Payload};
pub use object::{Object, SharedRegion};
pub use tracker::StateTracker;
