mod task_id;
pub use task_id::TaskId;

mod task_event;
pub use task_event::TaskEvent;

mod task;
pub use task::{PoolKind, Task};

mod validation;
pub use validation::ValidationResult;

mod task_response;
pub use task_response::{ResponseStatus, TaskResponse};

mod heartbeat;
pub use heartbeat::{DelegateStatus, Heartbeat, HeartbeatReply};

mod registration;
pub use registration::{Registration, RegistrationReply, SELF_DESTRUCT, UpgradeInfo};

mod sequence;
pub use sequence::SequenceToken;

mod local;
pub use local::{LocalCommand, LocalStatus, WatcherStatus};

/// Identifier the manager assigns to a registered delegate.
pub type DelegateId = String;

/// Wall-clock timestamp in milliseconds since the unix epoch.
pub type EpochMillis = u64;

/// Timeout value in milliseconds.
pub type TimeoutMs = u64;
