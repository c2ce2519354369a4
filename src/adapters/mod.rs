//! Capability adapters.
//!
//! Adapters wrap the heterogeneous step backends (model serving, the
//! tool/MCP execution service, RPA drivers) behind one invocation
//! contract so the scheduler never sees transport details.

mod model;
mod registry;
mod rpa;
mod tool;
mod types;

pub use model::ModelAdapter;
pub use registry::AdapterRegistry;
pub use rpa::RpaAdapter;
pub use tool::ToolAdapter;
pub use types::{Adapter, CallContext};
