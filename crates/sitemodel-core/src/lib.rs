pub mod collector;
pub mod config;
pub mod error;
pub mod memory;
pub mod resolver;
pub mod snapshot;
pub mod traits;
pub mod types;

pub use collector::*;
pub use config::*;
pub use error::*;
pub use memory::*;
pub use resolver::*;
pub use snapshot::*;
pub use traits::*;
pub use types::*;
