pub mod accessor;
pub(crate) mod migration;
pub(crate) mod schema;
mod sqlite;

pub use accessor::Accessor;
pub use migration::MigrationReport;
pub use sqlite::Sqlite;
