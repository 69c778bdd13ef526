pub mod batcher;
pub mod executor;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod stage;
pub mod stats;
pub mod worker;

pub use batcher::*;
pub use executor::*;
pub use registry::*;
pub use request::*;
pub use scheduler::*;
pub use stage::*;
pub use stats::*;
pub use worker::*;
