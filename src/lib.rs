pub mod clienv;
pub mod daemon;
pub mod error;
pub mod plan;
pub mod state;

pub use daemon::{Daemon, DaemonClient, DaemonConfig, DaemonServer};
pub use error::{Error, Result};
pub use plan::Plan;
