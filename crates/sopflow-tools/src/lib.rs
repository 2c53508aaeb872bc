pub mod adapter;
pub mod builtin;
pub mod http_reasoner;
pub mod output;
pub mod registry;
pub mod signature;

pub use adapter::ToolAdapter;
pub use http_reasoner::HttpReasoner;
pub use output::parse_structured_output;
pub use registry::{ToolDescriptor, ToolRegistry};
pub use signature::validate_args;
