mod connection;
mod protocol;
mod routes;
mod server;
mod state;

pub use protocol::RunAccepted;
pub use server::{build_router, GatewayServer};
pub use state::AppState;
