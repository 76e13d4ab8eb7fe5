mod segments;
mod state;

pub use segments::SegmentCollector;
pub use state::ClusterStateCollector;
