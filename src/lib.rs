pub mod api;
pub mod artifacts;
pub mod cli;
pub mod dispatch;
pub mod engine;
pub mod storage;
pub mod tokens;
