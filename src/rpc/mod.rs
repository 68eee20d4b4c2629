//! Cross-context request/response protocol.

pub mod channel;
pub mod error;
pub mod registry;

pub use channel::RpcChannel;
pub use error::{FailureKind, RpcError};
pub use registry::{CorrelationRegistry, PendingResponse, Settlement, DEFAULT_TIMEOUT};
