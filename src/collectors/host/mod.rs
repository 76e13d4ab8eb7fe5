mod disk;
mod resource_groups;
mod spill;

pub use disk::DiskSpaceCollector;
pub use resource_groups::ResourceGroupCollector;
pub use spill::SpillFilesCollector;
