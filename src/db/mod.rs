//! Storage layer: models, the interfaces the engine consumes, and two
//! implementations (SQLite for the binary, in-memory for tests).

mod memory;
mod models;
mod sqlite;
mod store;

pub use memory::*;
pub use models::*;
pub use sqlite::*;
pub use store::*;
