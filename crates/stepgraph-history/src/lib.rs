pub mod store;

pub use store::SqliteHistory;
