pub mod resolver;
pub mod store;

pub use resolver::{current_step, is_last_actionable, next_step, RoutingError};
pub use store::{default_definition, DefinitionError, DefinitionSource, DefinitionStore};
