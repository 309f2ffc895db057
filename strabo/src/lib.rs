#[macro_use]
extern crate log;

pub mod coordinator;
pub mod error;
pub mod filesystem;
pub mod geohash;
pub mod grid;
pub mod hash;
pub mod node;
pub mod partition;
pub mod pool;
pub mod reactor;
pub mod store;
pub mod topology;
pub mod worker;

pub use error::Error;
