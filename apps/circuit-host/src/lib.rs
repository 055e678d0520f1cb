pub mod cache;
pub mod circuit;
pub mod config;
pub mod delivery;
pub mod error;
pub mod fault;
pub mod hub;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod server;
pub mod stream;
pub mod transport;

pub use circuit::{Circuit, CircuitHandler, CircuitId, CircuitIdFactory, HandlerHook};
pub use config::CircuitOptions;
pub use error::CircuitError;
pub use hub::{CircuitHub, CircuitHubBuilder};
pub use registry::{CircuitPresence, CircuitRegistry};
pub use transport::{ChannelHandle, ClientChannel, ConnectionToken, TransportError};
