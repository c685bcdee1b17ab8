//! Node execution records, the status machine, and their persistence
//! boundary.

mod node;
mod status;
mod store;

pub use node::{ExecutableResponse, InterruptKind, InterruptRecord, NodeExecution};
pub use status::{FailureInfo, FailureType, NodeStatus};
pub use store::{InMemoryNodeExecutionStore, NodeExecutionStore};
