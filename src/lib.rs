pub mod arena;
pub mod aux;
pub mod errors;
pub mod flow;
pub mod hint;
pub mod id;
pub mod pool;
pub mod slot;
pub mod table;

pub use errors::Error;
pub use flow::{
    AcCascade, AcThresholds, AccessCategory, AdmissionPolicy, FlowControlPool, FlowStatus,
    FreeOutcome, GlobalThreshold, PauseHook, PauseReason, PauseStats, QueueAction, Transition,
};
pub use id::DescId;
pub use pool::{DescChain, DescFlags, DescGuard, DescriptorPool, PoolStats, TxDesc};
pub use table::{DetachOutcome, PoolTable};
