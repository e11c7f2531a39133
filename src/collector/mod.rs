pub mod crowd;

pub use crowd::{rank_volumes, CrowdCollector, DistributionSyncStats, VolumeSyncStats};
