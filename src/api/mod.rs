pub mod error;
pub mod operations;
pub mod response;
pub mod server;
