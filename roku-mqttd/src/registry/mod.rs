pub mod devices;
pub mod ledger;

pub use devices::{DeviceRecord, KnownApp, PollMode, Registry, Upsert};
pub use ledger::LivenessLedger;
