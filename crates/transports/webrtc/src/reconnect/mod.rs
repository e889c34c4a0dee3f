//! Recovery from lost connections
//!
//! Two independent mechanisms:
//!
//! - [`ReconnectPolicy`]: jittered, bounded delays between relay reconnect
//!   attempts
//! - [`ReconnectionController`]: single-flight teardown and rebuild of the
//!   peer connection after it fails

mod controller;
mod policy;

pub use controller::{PeerLifecycle, ReconnectionController};
pub use policy::ReconnectPolicy;
