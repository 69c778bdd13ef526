pub mod error;
pub mod spec;
pub mod stage;
pub mod tensor;

pub use error::*;
pub use spec::*;
pub use stage::*;
pub use tensor::*;
