pub mod jsonrpc;
pub mod message;
pub mod unit_actor;
pub mod unit_runtime;

pub use unit_actor::{Method, UnitHandle};
pub use unit_runtime::UnitHandler;
