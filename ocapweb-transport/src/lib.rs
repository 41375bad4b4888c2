// Transport implementations for the ocapweb protocol engine.
//
// The engine consumes the narrow `RpcTransport` interface from
// ocapweb-core; this crate provides the concrete carriers: an in-memory
// duplex pair (the MessagePort analogue), framing codecs for byte streams,
// and the one-round-trip batch adapter.

pub mod batch;
pub mod channel;
pub mod framed;

pub use batch::{decode_batch, encode_batch, BatchTransport};
pub use channel::{duplex_pair, ChannelTransport, SeverHandle};
pub use framed::{FramingError, LengthPrefixedCodec, NewlineDelimitedCodec, StreamTransport};

pub use ocapweb_core::protocol::transport::{RpcTransport, TransportError};
