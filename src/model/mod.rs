pub mod candidate;
pub mod catalog;
pub mod common;

pub use candidate::*;
pub use catalog::*;
pub use common::*;
