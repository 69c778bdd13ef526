pub mod builder;
pub mod definition;
pub mod error;
pub mod plan;

pub use builder::*;
pub use definition::*;
pub use error::*;
pub use plan::*;
