#![forbid(unsafe_code)]

mod engine;
mod state;
mod transport;


pub use engine::{Engine, EngineConfig, EngineError, EngineHandle};
pub use state::ConnectionState;
pub use transport::{BoxFuture, BoxTransport, Transport, TransportConnector, WsTransport};
