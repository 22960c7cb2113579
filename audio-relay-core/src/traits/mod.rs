pub mod backend;
pub mod delegate;
pub mod endpoint;
