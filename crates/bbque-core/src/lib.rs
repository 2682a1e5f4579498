pub mod config;
pub mod path;
pub mod types;

pub use config::BbqueConfig;
pub use path::{PathError, PathSegment, ResourcePath, ResourceType};
pub use types::*;
