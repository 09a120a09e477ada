mod process_store;
pub mod project;
pub mod registry;

pub use process_store::{OutputReaders, ProcessStore};
pub use project::ProjectTools;
pub use registry::{ToolOutput, ToolRegistry, Toolset};
