//! # whitenoise-node
//!
//! Node assembly: builds the circuit core over a host in one of the three
//! service modes, runs the maintenance tasks (client lease sweeps,
//! disconnect-driven eviction), and provides the daemon's configuration
//! surface.

pub mod config;
pub mod node;

pub use config::NodeConfig;
pub use node::Node;
