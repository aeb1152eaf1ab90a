pub mod database;
pub mod error;
pub mod factories;
pub mod row_helpers;
pub mod schema;
pub mod trees;

pub use database::Database;
pub use error::StoreError;
pub use factories::FactoryRepo;
pub use trees::TreeRepo;
