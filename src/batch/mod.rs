//! Batch execution of image tasks over a bounded number of execution contexts.

pub mod aggregation;
pub mod dispatcher;
pub mod progress;
pub mod scheduler;
pub mod types;

pub use aggregation::*;
pub use dispatcher::TaskDispatcher;
pub use progress::{ProgressCallback, ProgressHub, Subscription};
pub use scheduler::*;
pub use types::*;
