//! Media session orchestration over a protoo signaling channel.
//!
//! [`DialogClient`] connects to a room server, loads router capabilities
//! into a media-engine device, creates one send and one receive transport,
//! joins the room and then keeps local producers and remote consumers in
//! step with the server. The media engine itself sits behind the traits in
//! [`engine`].

pub mod capabilities;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod events;
pub mod pending;
pub mod producer;
pub mod scope;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;


pub use config::{DialogConfig, IcePolicy, IceRestartPolicy, ServerParams, TurnConfig};
pub use consumer::{BlockList, Consumer, ConsumerState, LayerStats};
pub use engine::{Direction, MediaKind, TrackRef};
pub use error::{DialogError, Severity};
pub use events::{DialogEvent, EventSink, RtcLevel, RtcTag};
pub use producer::{ProduceParams, Producer, ProducerKind};
pub use session::{DialogClient, ServerResolver, SessionState, SignalingSession, StaticResolver};
