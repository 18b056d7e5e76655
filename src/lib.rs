// Library surface shared by the daemon binary, integration tests and benches.

pub mod config;
pub mod constants;
pub mod error;
pub mod network;
pub mod node;
pub mod shutdown;
pub mod storage;
