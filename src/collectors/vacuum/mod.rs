mod databases;
mod tables;

pub use databases::DatabaseVacuumCollector;
pub use tables::TableVacuumCollector;
