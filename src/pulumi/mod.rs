/// Pulumi engine integration
pub mod cli;
pub mod program;

pub use cli::{PulumiCli, StackOutputs};
pub use program::render;
