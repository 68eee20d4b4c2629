//! Request/response channel into one execution context.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, instrument};

use super::error::RpcError;
use super::registry::CorrelationRegistry;
use crate::context::ContextCommand;
use crate::protocol::{
    decode_response, encode_request, CodecError, CorrelationIdGenerator, ImagePayload,
    Operation, Request, ResponseData, ResponseOutcome,
};

/// Sends typed requests into an execution context and correlates the responses.
///
/// Cloning is cheap; clones share the transport, the registry and the id sequence.
#[derive(Clone, Debug)]
pub struct RpcChannel {
    context: Arc<str>,
    transport: mpsc::UnboundedSender<ContextCommand>,
    registry: CorrelationRegistry,
    ids: Arc<CorrelationIdGenerator>,
}

impl RpcChannel {
    pub fn new(
        context: impl Into<Arc<str>>,
        transport: mpsc::UnboundedSender<ContextCommand>,
        registry: CorrelationRegistry,
    ) -> Self {
        Self {
            context: context.into(),
            transport,
            registry,
            ids: Arc::new(CorrelationIdGenerator::new()),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Sends one request and waits for its settlement.
    ///
    /// Exactly one frame is written to the transport per call.
    #[instrument(skip(self, payload), fields(context = %self.context, operation = %operation.kind()))]
    pub async fn send(
        &self,
        operation: Operation,
        payload: ImagePayload,
    ) -> Result<ResponseData, RpcError> {
        let id = self.ids.next_id();
        let frame = encode_request(&Request::new(id.clone(), operation, payload))?;
        let pending = self.registry.register(id.clone())?;

        debug!(correlation_id = %id, frame_bytes = frame.len(), "Sending request");
        if self.transport.send(ContextCommand::Request(frame)).is_err() {
            // A vanished context invalidates everything outstanding, including this request.
            self.registry.clear_all(RpcError::TransportError(format!(
                "execution context '{}' is not accepting messages",
                self.context
            )));
        }

        pending.await
    }

    /// Routes a response frame to its waiting caller.
    ///
    /// Returns `Ok(false)` when the id is unknown, e.g. after a timeout.
    pub fn deliver(&self, frame: &[u8]) -> Result<bool, CodecError> {
        let response = decode_response(frame)?;
        let id = response.id;

        let settled = match response.outcome {
            ResponseOutcome::Success(data) => self.registry.resolve(&id, data),
            ResponseOutcome::Failure(message) => {
                self.registry.reject(&id, RpcError::RemoteError(message))
            }
        };

        if !settled {
            debug!(
                context = %self.context,
                correlation_id = %id,
                took_ms = response.took_ms,
                "Dropping response for unknown correlation"
            );
        }
        Ok(settled)
    }

    /// Rejects every request outstanding on this channel.
    pub fn fail_all(&self, error: RpcError) -> usize {
        self.registry.clear_all(error)
    }

    /// Asks the context to stop once its current computation returns.
    pub(crate) fn shutdown(&self) {
        let _ = self.transport.send(ContextCommand::Shutdown);
    }
}
