pub mod protocol;
pub mod thread;

pub use protocol::{Client, Message, Program, RpcServer};
pub use thread::{PoolConfig, WorkerPool};
