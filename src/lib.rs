// src/lib.rs
pub mod config;
pub mod error;
pub mod session;
pub mod tracking;
pub mod utils;

#[cfg(feature = "python")]
pub mod bindings;

pub use error::{TrackingError, TrackingResult};
pub use session::{ChannelGroup, SessionId, SessionStore, UnitId};
pub use tracking::{IdentifiedUnit, MultiSessionTracker};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
