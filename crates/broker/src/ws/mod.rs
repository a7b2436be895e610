mod handler;
mod registry;

pub use handler::{router, WsState};
pub use registry::{Broker, ConnectionId, UserId};
