//! Custom Resource Definitions consumed by the provisioning core

mod vdc;

pub use vdc::{LimitRangeSpec, QuotaSpec, VirtualDataCenter, VirtualDataCenterSpec};
