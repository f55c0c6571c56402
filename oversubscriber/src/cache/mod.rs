mod device_cache;
mod policy;
mod staged;

pub use device_cache::{DeviceCache, FlushBatch, Residency};
pub use policy::EvictionPolicy;
pub use staged::StagedRows;

pub(crate) use device_cache::ResidencyPlan;
