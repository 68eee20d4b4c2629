pub mod codec;
pub mod message;
pub mod operation;
pub mod payload;

pub use codec::*;
pub use message::*;
pub use operation::*;
pub use payload::*;
