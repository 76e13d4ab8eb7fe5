mod connections;
mod database_size;
mod extended_locks;
mod locks;

pub use connections::ConnectionsCollector;
pub use database_size::DatabaseSizeCollector;
pub use extended_locks::ExtendedLocksCollector;
pub use locks::LocksCollector;
