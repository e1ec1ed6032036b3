/// Desired-state declaration API
pub mod context;
pub mod plan;
pub mod resources;

pub use context::{Context, Declaration, DeclarationError, ResourceOptions};
pub use plan::{Plan, ResourceIntent};
pub use resources::*;
