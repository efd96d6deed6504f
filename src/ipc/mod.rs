//! Secure channel between the caller and the privileged helper.
//!
//! Length-prefixed JSON frames ([`frame`]) carry the messages defined in
//! [`protocol`]. The caller side lives in [`client`]; the helper crate owns
//! the server side and reuses the same frame codec and message types.

pub mod client;
pub mod frame;
pub mod protocol;

pub use client::{ChannelError, ClientSettings, Connector, HelperClient, InProcessConnector};
pub use frame::{read_frame, write_frame, FrameError};
pub use protocol::{ClientMessage, HelperRequest, HelperResponse, Operation, ServerMessage};
