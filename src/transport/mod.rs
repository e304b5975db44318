//! Framed TCP transport shared by clients and supervisors.
//!
//! - [`codec`]: the `Envelope` wire type and its delimiter framing, also used
//!   on worker pipes
//! - [`socket`]: server/client sockets with timeout-bounded send and receive

pub mod codec;
pub mod socket;

pub use codec::{Envelope, EnvelopeCodec, DEFAULT_MAX_MESSAGE_SIZE};
pub use socket::{Delivery, Socket, SocketOptions};
