pub mod backend;
pub mod error;
pub mod firefly;
pub mod netlink;
pub mod runtime;
pub mod source;
