// Object-capability RPC engine.
//
// The protocol pairs an expression language (values that may contain
// capability references) with promise pipelining: callers invoke methods on
// results that have not resolved yet and the peer executes the implied
// dataflow without extra round trips.

pub mod error;
pub mod protocol;

pub use error::{ErrorCode, RpcError};
pub use protocol::{
    parse_batch, serialize_batch, structurally_equal, AbortController, BinaryCodec, Codec,
    CodecError, ErrorValue, ExportId, Expression, Frame, ImportId, Kind, Message, PropertyKey,
    RpcPromise, RpcSession, RpcTransport, SendErrorHook, SessionOptions, SessionState,
    StructuredCodec, Stub, TaggedCodec, TransportError, Value,
};

pub use async_trait::async_trait;

/// A capability implementation: anything addressable by the peer.
///
/// Method dispatch is by name; unknown names are errors. Field reads go
/// through `get_property`, and a method-only target should reject them
/// rather than yield a silent undefined.
#[async_trait]
pub trait RpcTarget: Send + Sync + std::fmt::Debug {
    /// Call a method on this capability.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError>;

    /// Read a property from this capability.
    async fn get_property(&self, property: &str) -> Result<Value, RpcError>;
}
