//! SLCP daemon: discovery, transport dispatching, and the bulk image channel.

pub mod bulk;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod dispatcher;
pub mod node;

pub use config::Config;
pub use directory::{spawn_directory, DirectoryClosed, DirectoryHandle};
pub use dispatcher::{Dispatcher, Outbound};
pub use node::{NodeHandle, SendError};
