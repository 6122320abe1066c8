// ABOUTME: Execution engine interfaces for podshim: task client and lifecycle event stream
// ABOUTME: Ships the in-process event hub and the Docker-backed engine built on bollard

pub mod docker;
pub mod error;
pub mod events;
pub mod task;

pub use docker::DockerRuntime;
pub use error::{StreamError, TaskError};
pub use events::{EventHub, EventKind, EventService, EventSubscription, LifecycleEvent};
pub use task::{KillScope, Signal, TaskInfo, TaskService, TaskStatus};
