//! Wire layer between the client and the remote debugging server.
//!
//! # Architecture
//!
//! - **codec**: `<length>:<json>` framing for AsyncRead/AsyncWrite
//! - **protocol**: Packet shapes, event vocabulary, actor ids
//! - **session**: One connection: handshake, session loop, request handle

pub mod codec;
pub mod protocol;
pub mod session;
