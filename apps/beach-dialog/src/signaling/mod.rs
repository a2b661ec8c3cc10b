pub mod channel;
pub mod link;
pub mod protocol;

pub use channel::{ChannelState, IncomingRequest, Responder, SignalingChannel, SignalingEvent};
pub use link::{
    LinkEvent, MemoryConnector, MemoryPeer, PROTOO_SUBPROTOCOL, SignalingConnector, SignalingLink,
    WebSocketConnector,
};
pub use protocol::{ClientRequest, Frame, ServerNotification, ServerRequest};
