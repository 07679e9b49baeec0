pub mod error;
pub mod filesystem;
pub mod order;
pub mod result;
pub mod scope;

pub use error::*;
pub use filesystem::*;
pub use result::*;
pub use scope::{Scope, ScopeRegistry, ScopedIdentifier};
