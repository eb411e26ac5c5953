//! tether-services: service location, RPC sessions and the buffered
//! write transport they run over.

pub mod channel;
pub mod gateway;
pub mod locator;
pub mod session;

pub use channel::{BufferedWriteChannel, ByteStream, Completion, Transport, TransportError};
pub use gateway::{GatewayError, ServiceGateway, ServiceMetadata};
pub use locator::{Locator, PeerDirectory, NODE_SERVICE};
pub use session::{
    Downstream, EventDescriptor, PushStream, RpcSession, SessionError, SessionPolicy,
    SessionState, SessionTable,
};
