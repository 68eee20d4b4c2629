//! Isolated execution contexts and their lifecycle.

pub mod collaborator;
pub mod handle;
pub mod registry;
pub mod worker;

pub use collaborator::{
    collaborator_factory, Collaborator, CollaboratorError, CollaboratorFactory,
    CollaboratorResult, SizedCompression,
};
pub use handle::{ContextFault, ContextState, ExecutionContextHandle};
pub use registry::{ContextLease, ContextRegistry, ContextRegistryBuilder};
pub use worker::{ContextCommand, ContextEvent};
