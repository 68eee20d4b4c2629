//! # offload
//!
//! Runs image operations inside isolated execution contexts and schedules batches of them.
//!
//! ## Overview
//!
//! Each execution context is a dedicated thread that owns a [`context::Collaborator`], the
//! component doing the actual pixel work. Callers talk to it through an [`rpc::RpcChannel`]:
//! every request carries a correlation id, is encoded into one binary frame, and settles
//! exactly once with a result, a remote failure, a timeout or a transport fault.
//!
//! [`batch::BatchScheduler`] drives a list of tasks through a sliding window of at most
//! `concurrency` outstanding requests, publishes progress after every transition and returns
//! the outcomes in submission order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use offload::batch::{BatchScheduler, Task};
//! use offload::context::{collaborator_factory, Collaborator, CollaboratorResult, ContextRegistry};
//! use offload::protocol::{CropParams, ImagePayload, Operation, OperationFamily};
//!
//! struct Cropper;
//!
//! impl Collaborator for Cropper {
//!     fn initialize(&mut self) -> CollaboratorResult<()> {
//!         Ok(())
//!     }
//!
//!     fn crop(
//!         &mut self,
//!         input: &[u8],
//!         width: u32,
//!         _height: u32,
//!         params: &CropParams,
//!         output: &mut [u8],
//!     ) -> CollaboratorResult<usize> {
//!         let row = params.width as usize * 4;
//!         for y in 0..params.height as usize {
//!             let src = ((params.y as usize + y) * width as usize + params.x as usize) * 4;
//!             output[y * row..(y + 1) * row].copy_from_slice(&input[src..src + row]);
//!         }
//!         Ok(row * params.height as usize)
//!     }
//! }
//!
//! # async fn example() -> offload::Result<()> {
//! let registry = ContextRegistry::builder()
//!     .family(OperationFamily::Transform, collaborator_factory(|| Cropper))
//!     .build()?;
//! let scheduler = BatchScheduler::new(Arc::new(registry));
//!
//! let crop = Operation::Crop(CropParams { x: 0, y: 0, width: 2, height: 2 });
//! let tasks = vec![Task::generated(crop, ImagePayload::new(vec![0u8; 4 * 4 * 4], 4, 4))];
//! let outcomes = scheduler.run(tasks, 2).await?;
//! assert!(outcomes[0].is_completed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: operations, payload validation, request/response frames and their codec
//! - [`rpc`]: correlation registry and request/response channel
//! - [`context`]: execution context handles, their threads and the context registry
//! - [`batch`]: scheduler, progress publication and result aggregation
//! - [`config`]: runtime configuration
//! - [`telemetry`]: tracing subscriber setup

#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for offload operations
pub type Result<T> = std::result::Result<T, OffloadError>;

/// Main error type for offload operations
#[derive(Error, Debug)]
pub enum OffloadError {
    /// A request through an execution context failed
    #[error("RPC error: {0}")]
    Rpc(#[from] rpc::RpcError),

    /// A batch run could not start
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] batch::SchedulerError),

    /// A payload or operation parameter is invalid
    #[error("Validation error: {0}")]
    Validation(#[from] protocol::ValidationError),

    /// A frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    /// Configuration is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Batch scheduling and progress
pub mod batch;

/// Runtime configuration
pub mod config;

/// Execution contexts
pub mod context;

/// Wire protocol
pub mod protocol;

/// Request/response plumbing
pub mod rpc;

/// Logging setup
pub mod telemetry;
