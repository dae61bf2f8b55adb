//! Database layer - index backends and the operations built on them

pub mod compat;
pub mod operations;
pub mod search;
pub mod sqlite;
pub mod traits;

pub use compat::GenericFind;
pub use operations::{IndexOperations, InstanceRecord, StoreStatus};
pub use sqlite::{SqliteDatabase, SqliteTransaction};
pub use traits::{Capabilities, DatabaseWrapper, Transaction};
