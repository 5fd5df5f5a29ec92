pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowError, Result};
pub use event::StatusBroadcaster;
pub use flow::{Edge, Flow, Node, Step};
pub use types::*;
