pub mod constants;
pub mod core;
pub mod error;
pub mod eval;
pub mod helper_call;
pub mod query;
pub mod runtime;
pub mod state;
pub mod template;
pub mod transport;
