//! Task acquisition, validation, dispatch and lifecycle engine of the delegate.
//!
//! The [`LifecycleController`] registers with the manager and then runs the
//! [`EventStream`], the [`Dispatcher`] and the heartbeat loops until it is told
//! to stop, drain or self-destruct. Every outer collaborator (manager, push
//! transport, local watcher channel, task runners) is injected through a trait.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod local;
pub mod manager;
pub mod pool;
pub mod prober;
pub mod router;
pub mod runner;
pub mod sequence;
pub mod source;
pub mod state;
pub mod supervisor;
pub mod system;

pub use config::EngineConfig;
pub use dispatcher::Dispatcher;
pub use error::CoreError;
pub use lifecycle::{AgentIdentity, AgentState, Collaborators, ControlHandle, LifecycleController, LifecycleState};
pub use manager::{ManagerClient, ManagerError};
pub use pool::{ExecutionPools, TaskHandle, WorkerPool};
pub use prober::CapabilityProber;
pub use router::RunnerRouter;
pub use runner::{Criterion, RunContext, Runner, RunnerError};
pub use sequence::SequenceFile;
pub use source::{EventStream, Inbound, Outlet, PushLink, PushTransport, SourceError, parse_inbound};
pub use state::{Admission, InFlight, Stage};
pub use supervisor::{TimeoutSupervisor, Verdict};
