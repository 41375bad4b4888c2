// Protocol engine: wire grammar, tables, marshaling, pipelining, and the
// session kernel.

pub mod cancel;
pub mod codec;
pub mod expression;
pub mod ids;
pub mod message;
pub mod session;
pub mod stub;
pub mod tables;
pub mod transport;
pub mod value;

mod devaluator;
mod evaluator;
mod pipeline;


pub use cancel::AbortController;
pub use codec::{
    parse_batch, serialize_batch, BinaryCodec, Codec, CodecError, Frame, Kind, StructuredCodec,
    TaggedCodec,
};
pub use expression::{ErrorExpression, Expression, ExpressionError, PropertyKey};
pub use ids::{ExportId, IdAllocator, ImportId};
pub use message::{Message, MessageError};
pub use session::{RpcSession, SendErrorHook, SessionOptions, SessionState};
pub use stub::{RpcPromise, Stub};
pub use tables::{ExportTable, ImportTable, TableError};
pub use transport::{RpcTransport, TransportError};
pub use value::{structurally_equal, ErrorValue, Value};
