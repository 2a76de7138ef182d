//! Typed read access to a blockchain node.

pub mod abi;
pub mod pool;
pub mod rpc;

pub use pool::PoolReader;
pub use rpc::{BlockRef, RpcClient};
