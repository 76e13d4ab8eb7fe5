pub mod datasource;
pub mod perdb;
pub mod version;

pub use version::{Version, VersionProbe};
