pub mod poller;
pub mod policy;

pub use poller::{ConditionPoller, GiveUp, PollError, PollOutcome};
pub use policy::{BackoffPolicy, PolicyConfig, StrategyKind, WaitStrategy};
