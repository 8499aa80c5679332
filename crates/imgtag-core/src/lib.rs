pub mod error;
pub mod macros;
pub mod model;
pub mod processor;

pub use error::ProcessError;
pub use model::{AccessLevel, Auth, ErrorCode, Info, JobContext, Status, Tag};
pub use processor::Processor;
