pub mod domain;
pub mod errors;
pub mod events;
pub mod ids;

pub use domain::{Child, Factory, FactoryPatch, NewFactory, Tree, TreePatch};
pub use errors::{ErrorKind, ValidationError};
pub use events::Event;
