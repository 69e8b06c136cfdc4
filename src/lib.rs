//! Per-fabric subscriber: bootstraps a consistent snapshot of a fabric's
//! logical state from its controller, follows live change events, and
//! fans work out to analyzer workers over a shared bus.
//!
//! The controller session, subscription layer, broker, and document
//! store are collaborator traits (`controller`, `bus`, `store`); their
//! production implementations live with the deployment.

pub mod bus;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod mo;
pub mod model;
pub mod msg;
pub mod settings;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod subscriber;
pub mod version;

pub use error::{Error, Result};
pub use subscriber::{FabricState, Subscriber};
