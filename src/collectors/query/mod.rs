mod duration;
mod vacuum_running;

pub use duration::ActiveQueryDurationCollector;
pub use vacuum_running::VacuumRunningCollector;
