pub mod actuator;
pub mod config;
pub mod context;
pub mod logger;
pub mod node;
pub mod nodes;
pub mod secret;
pub mod unit;
pub mod util;
pub mod vehicle;
