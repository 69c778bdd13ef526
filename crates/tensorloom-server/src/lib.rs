pub mod http;
pub mod repository;
pub mod settings;

pub use http::*;
pub use repository::*;
pub use settings::*;
