use async_trait::async_trait;

use super::types::Task;
use crate::context::ExecutionContextHandle;
use crate::protocol::ResponseData;
use crate::rpc::RpcError;

/// Where the scheduler sends each dispatched task.
///
/// Implementations must settle every call; the scheduler holds one slot per outstanding call.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: &Task) -> Result<ResponseData, RpcError>;
}

/// A single handle serves every task itself. Tasks beyond the first wait their turn, so any
/// concurrency works against one handle.
#[async_trait]
impl TaskDispatcher for ExecutionContextHandle {
    async fn dispatch(&self, task: &Task) -> Result<ResponseData, RpcError> {
        self.submit(task.operation, task.input.clone()).await
    }
}
