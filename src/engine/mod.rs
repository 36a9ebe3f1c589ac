pub mod context;
pub mod error;
pub mod pipeline;
pub mod types;
