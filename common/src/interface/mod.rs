pub mod handler;
pub mod source;

pub use handler::*;

pub use source::*;
