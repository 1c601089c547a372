//! Host-and-member group chat rooms over peer-to-peer links.
//!
//! A room is identified by its host's peer id. Members hold one link, to the
//! host, which relays membership changes and chat messages to everyone else.
//! [`ChatNode`] is the synchronous core; [`spawn_node`] drives one on tokio.

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod network;
pub mod session;
pub mod sync;

pub use config::ChatConfig;
pub use error::ChatError;
pub use model::{ChatMessage, PeerId, Room, User};
pub use session::{spawn_node, ChatNode, NodeHandle, SessionEvent};
