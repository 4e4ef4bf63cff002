pub mod build;
pub mod classify;
pub mod error;
pub mod resolve;
pub mod rewrite;
