pub mod constraint_index;
pub mod equivalence;
pub mod hierarchy;
pub mod resolver;
pub mod traverse;
pub mod validate;

pub use constraint_index::*;
pub use equivalence::*;
pub use hierarchy::*;
pub use resolver::*;
