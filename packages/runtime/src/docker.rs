// ABOUTME: Docker-backed execution engine implementing the task client and event stream
// ABOUTME: Uses bollard for inspect/kill/remove and a background watcher over Docker's event feed

use crate::error::{StreamError, TaskError};
use crate::events::{EventHub, EventKind, EventService, EventSubscription, LifecycleEvent};
use crate::task::{KillScope, Signal, TaskInfo, TaskService, TaskStatus};
use async_trait::async_trait;
use bollard::{
    container::{InspectContainerOptions, KillContainerOptions, RemoveContainerOptions},
    errors::Error as BollardError,
    models::{ContainerStateStatusEnum, EventMessage},
    system::EventsOptions,
    Docker,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use podshim_config::constants::DOCKER_HOST;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before re-attaching to the Docker event feed after it failed
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Docker actions forwarded as lifecycle events
const WATCHED_ACTIONS: [&str; 4] = ["start", "die", "oom", "destroy"];

type PidLedger = Arc<Mutex<HashMap<String, u32>>>;

/// Execution engine on top of the Docker daemon.
///
/// Docker's `die` events carry no pid, so the runtime remembers the pid it
/// saw for each running container on `get_task` and stamps it onto the exit
/// event. `get_task` holds the ledger for the whole inspect, so a `die`
/// handled by the watcher either precedes the inspect (which then reports
/// the container stopped) or sees the recorded pid.
///
/// The watcher resumes Docker's feed from the last forwarded event after a
/// failure, so events emitted while it was detached still reach
/// subscribers. Must be created inside a Tokio runtime.
pub struct DockerRuntime {
    client: Docker,
    hub: EventHub,
    pids: PidLedger,
    shutdown: CancellationToken,
}

impl DockerRuntime {
    /// Connect using the local defaults (socket or `DOCKER_HOST`)
    pub fn connect() -> Result<Self, TaskError> {
        if let Ok(host) = std::env::var(DOCKER_HOST) {
            debug!("Connecting to Docker at {}", host);
        }
        let client = Docker::connect_with_defaults()
            .map_err(|e| TaskError::Runtime(format!("Docker connection failed: {}", e)))?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client and start watching its event feed
    pub fn with_client(client: Docker) -> Self {
        let runtime = Self {
            client,
            hub: EventHub::new(),
            pids: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        };

        // Nothing can subscribe before now, so the feed starts here
        tokio::spawn(watch_events(
            runtime.client.clone(),
            runtime.hub.clone(),
            runtime.pids.clone(),
            FeedCursor::starting_at(Utc::now()),
            runtime.shutdown.clone(),
        ));

        runtime
    }
}

impl Drop for DockerRuntime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl TaskService for DockerRuntime {
    async fn get_task(&self, id: &str) -> Result<TaskInfo, TaskError> {
        let mut pids = self.pids.lock().await;
        let inspect = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify_error(id, e))?;

        let state = inspect
            .state
            .ok_or_else(|| TaskError::Runtime(format!("Container {} has no state", id)))?;

        let status = convert_status(state.status, state.running);
        let pid = state
            .pid
            .and_then(|pid| u32::try_from(pid).ok())
            .unwrap_or(0);

        if status == TaskStatus::Running && pid > 0 {
            pids.insert(id.to_string(), pid);
        }
        drop(pids);

        Ok(TaskInfo {
            id: id.to_string(),
            status,
            pid,
            exit_code: state.exit_code,
        })
    }

    async fn kill_task(&self, id: &str, signal: Signal, scope: KillScope) -> Result<(), TaskError> {
        // Docker signals the container's init; in a private pid namespace a
        // SIGKILL to init takes every process of the group with it.
        debug!(
            "Killing container {} with {} (scope: {:?})",
            id,
            signal.as_str(),
            scope
        );

        let options = KillContainerOptions {
            signal: signal.as_str(),
        };

        self.client
            .kill_container(id, Some(options))
            .await
            .map_err(|e| classify_error(id, e))
    }

    async fn delete_task(&self, id: &str) -> Result<(), TaskError> {
        let options = RemoveContainerOptions {
            force: false,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| classify_error(id, e))?;

        info!("Removed container {}", id);
        Ok(())
    }
}

#[async_trait]
impl EventService for DockerRuntime {
    async fn subscribe(&self, cancel: CancellationToken) -> Result<EventSubscription, StreamError> {
        self.hub.subscribe(cancel).await
    }
}

/// Map a bollard error onto the closed task error kinds
fn classify_error(id: &str, error: BollardError) -> TaskError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => TaskError::NotFound(id.to_string()),
        // Docker answers 409 when killing a container that is not running
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } if message.contains("not running") => TaskError::AlreadyExited(id.to_string()),
        other => TaskError::Runtime(other.to_string()),
    }
}

/// Convert Docker container state to task status
fn convert_status(status: Option<ContainerStateStatusEnum>, running: Option<bool>) -> TaskStatus {
    match status {
        Some(ContainerStateStatusEnum::RUNNING)
        | Some(ContainerStateStatusEnum::PAUSED)
        | Some(ContainerStateStatusEnum::RESTARTING) => TaskStatus::Running,
        Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD)
        | Some(ContainerStateStatusEnum::REMOVING) => TaskStatus::Stopped,
        Some(ContainerStateStatusEnum::CREATED) => TaskStatus::Created,
        _ => {
            if running.unwrap_or(false) {
                TaskStatus::Running
            } else {
                TaskStatus::Created
            }
        }
    }
}

fn event_nanos(message: &EventMessage) -> Option<i64> {
    message
        .time_nano
        .or_else(|| message.time.map(|secs| secs.saturating_mul(1_000_000_000)))
}

/// Position on Docker's event feed: the time of the last forwarded event and
/// the events already forwarded at exactly that time.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FeedCursor {
    last_nanos: i64,
    boundary: Vec<(String, String)>,
}

impl FeedCursor {
    fn starting_at(time: DateTime<Utc>) -> Self {
        Self {
            last_nanos: time.timestamp_nanos_opt().unwrap_or(i64::MAX),
            boundary: Vec::new(),
        }
    }

    /// Resume point for the next attach, rounded down to whole seconds since
    /// Docker reads the fraction of `since` as a decimal. Docker replays
    /// from here and `admit` drops what was already forwarded.
    fn since(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_nanos.div_euclid(1_000_000_000), 0)
            .unwrap_or_default()
    }

    /// Record `message` as forwarded, or return false when it was already
    /// forwarded or predates the cursor.
    fn admit(&mut self, message: &EventMessage) -> bool {
        let Some(nanos) = event_nanos(message) else {
            return true;
        };
        let key = (
            message
                .actor
                .as_ref()
                .and_then(|actor| actor.id.clone())
                .unwrap_or_default(),
            message.action.clone().unwrap_or_default(),
        );

        match nanos.cmp(&self.last_nanos) {
            Ordering::Less => false,
            Ordering::Equal => {
                if self.boundary.contains(&key) {
                    false
                } else {
                    self.boundary.push(key);
                    true
                }
            }
            Ordering::Greater => {
                self.last_nanos = nanos;
                self.boundary = vec![key];
                true
            }
        }
    }
}

fn feed_options(cursor: &FeedCursor) -> EventsOptions<String> {
    let filters = HashMap::from([
        ("type".to_string(), vec!["container".to_string()]),
        (
            "event".to_string(),
            WATCHED_ACTIONS.iter().map(|a| a.to_string()).collect(),
        ),
    ]);
    EventsOptions::<String> {
        since: Some(cursor.since()),
        until: None,
        filters,
    }
}

fn event_time(message: &EventMessage) -> DateTime<Utc> {
    if let Some(nanos) = message.time_nano {
        if let Some(time) =
            DateTime::from_timestamp(nanos / 1_000_000_000, (nanos % 1_000_000_000) as u32)
        {
            return time;
        }
    }
    message
        .time
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

async fn translate_event(message: &EventMessage, pids: &PidLedger) -> Option<LifecycleEvent> {
    let actor = message.actor.as_ref()?;
    let container_id = actor.id.clone()?;
    let action = message.action.as_deref()?;

    let kind = match action {
        "start" => EventKind::TaskStart,
        "die" => EventKind::TaskExit {
            exit_status: actor
                .attributes
                .as_ref()
                .and_then(|attrs| attrs.get("exitCode"))
                .and_then(|code| code.parse().ok()),
        },
        "oom" => EventKind::TaskOom,
        "destroy" => EventKind::TaskDelete,
        _ => return None,
    };

    let pid = {
        let mut pids = pids.lock().await;
        if kind == EventKind::TaskDelete {
            pids.remove(&container_id).unwrap_or(0)
        } else {
            pids.get(&container_id).copied().unwrap_or(0)
        }
    };

    Some(LifecycleEvent {
        container_id,
        pid,
        timestamp: event_time(message),
        kind,
    })
}

async fn watch_events(
    client: Docker,
    hub: EventHub,
    pids: PidLedger,
    mut cursor: FeedCursor,
    shutdown: CancellationToken,
) {
    info!("Docker event watcher started");

    loop {
        debug!("Attaching to Docker event feed since {}", cursor.since());
        let mut stream = client.events(Some(feed_options(&cursor)));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    hub.fail_all(StreamError::Closed).await;
                    info!("Docker event watcher stopped");
                    return;
                }
                item = stream.next() => match item {
                    Some(Ok(message)) => {
                        if !cursor.admit(&message) {
                            debug!("Skipping replayed Docker event {:?}", message.action);
                        } else if let Some(event) = translate_event(&message, &pids).await {
                            hub.publish(event).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Docker event feed failed: {}", e);
                        hub.fail_all(StreamError::Runtime(e.to_string())).await;
                        break;
                    }
                    None => {
                        warn!("Docker event feed ended");
                        hub.fail_all(StreamError::Closed).await;
                        break;
                    }
                },
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Docker event watcher stopped");
                return;
            }
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::EventActor;
    use rstest::rstest;

    #[rstest]
    #[case(Some(ContainerStateStatusEnum::RUNNING), None, TaskStatus::Running)]
    #[case(Some(ContainerStateStatusEnum::PAUSED), None, TaskStatus::Running)]
    #[case(Some(ContainerStateStatusEnum::EXITED), None, TaskStatus::Stopped)]
    #[case(Some(ContainerStateStatusEnum::DEAD), None, TaskStatus::Stopped)]
    #[case(Some(ContainerStateStatusEnum::CREATED), None, TaskStatus::Created)]
    #[case(None, Some(true), TaskStatus::Running)]
    #[case(None, None, TaskStatus::Created)]
    fn test_convert_status(
        #[case] status: Option<ContainerStateStatusEnum>,
        #[case] running: Option<bool>,
        #[case] expected: TaskStatus,
    ) {
        assert_eq!(convert_status(status, running), expected);
    }

    #[test]
    fn test_classify_not_found() {
        let err = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: c1".to_string(),
        };
        assert_eq!(classify_error("c1", err), TaskError::NotFound("c1".to_string()));
    }

    #[test]
    fn test_classify_not_running_conflict() {
        let err = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "Container c1 is not running".to_string(),
        };
        assert_eq!(
            classify_error("c1", err),
            TaskError::AlreadyExited("c1".to_string())
        );
    }

    #[test]
    fn test_classify_other_conflict_is_runtime_error() {
        let err = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "You cannot remove a running container".to_string(),
        };
        assert!(matches!(classify_error("c1", err), TaskError::Runtime(_)));
    }

    fn die_message(id: &str, exit_code: &str) -> EventMessage {
        EventMessage {
            action: Some("die".to_string()),
            actor: Some(EventActor {
                id: Some(id.to_string()),
                attributes: Some(HashMap::from([(
                    "exitCode".to_string(),
                    exit_code.to_string(),
                )])),
            }),
            time: Some(1_700_000_000),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_die_event_carries_recorded_pid() {
        let pids: PidLedger = Arc::new(Mutex::new(HashMap::from([("c1".to_string(), 4242)])));

        let event = translate_event(&die_message("c1", "137"), &pids)
            .await
            .unwrap();

        assert!(event.is_exit_of("c1", 4242));
        assert_eq!(
            event.kind,
            EventKind::TaskExit {
                exit_status: Some(137)
            }
        );
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_destroy_event_forgets_pid() {
        let pids: PidLedger = Arc::new(Mutex::new(HashMap::from([("c1".to_string(), 7)])));
        let message = EventMessage {
            action: Some("destroy".to_string()),
            actor: Some(EventActor {
                id: Some("c1".to_string()),
                attributes: None,
            }),
            ..Default::default()
        };

        let event = translate_event(&message, &pids).await.unwrap();

        assert_eq!(event.kind, EventKind::TaskDelete);
        assert!(pids.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unwatched_actions_are_dropped() {
        let pids: PidLedger = Arc::new(Mutex::new(HashMap::new()));
        let message = EventMessage {
            action: Some("attach".to_string()),
            actor: Some(EventActor {
                id: Some("c1".to_string()),
                attributes: None,
            }),
            ..Default::default()
        };

        assert!(translate_event(&message, &pids).await.is_none());
    }

    #[tokio::test]
    async fn test_die_waits_for_pid_being_recorded() {
        let pids: PidLedger = Arc::new(Mutex::new(HashMap::new()));

        // An inspect in flight holds the ledger
        let mut held = pids.lock().await;
        let translating = tokio::spawn({
            let pids = pids.clone();
            async move { translate_event(&die_message("c1", "0"), &pids).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!translating.is_finished());

        held.insert("c1".to_string(), 42);
        drop(held);

        let event = translating.await.unwrap().unwrap();
        assert!(event.is_exit_of("c1", 42));
    }

    fn message_at(id: &str, action: &str, nanos: i64) -> EventMessage {
        EventMessage {
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some(id.to_string()),
                attributes: None,
            }),
            time: Some(nanos / 1_000_000_000),
            time_nano: Some(nanos),
            ..Default::default()
        }
    }

    const T0: i64 = 1_700_000_000_000_000_000;

    fn earlier_cursor() -> FeedCursor {
        FeedCursor::starting_at(DateTime::from_timestamp(1_600_000_000, 0).unwrap())
    }

    #[test]
    fn test_first_attach_starts_at_construction() {
        let start = DateTime::from_timestamp(1_700_000_000, 250).unwrap();
        let cursor = FeedCursor::starting_at(start);

        let options = feed_options(&cursor);

        assert_eq!(
            options.since,
            Some(DateTime::from_timestamp(1_700_000_000, 0).unwrap())
        );
        assert_eq!(
            options.filters.get("type"),
            Some(&vec!["container".to_string()])
        );
    }

    #[test]
    fn test_reattach_resumes_no_later_than_last_forwarded_event() {
        let mut cursor = earlier_cursor();
        assert!(cursor.admit(&message_at("c1", "start", T0)));
        assert!(cursor.admit(&message_at("c1", "die", T0 + 1_500)));

        // Feed fails here; the next attach replays from the last event
        let since = feed_options(&cursor).since.unwrap();
        let last = DateTime::from_timestamp(T0 / 1_000_000_000, 1_500).unwrap();
        assert!(since <= last);
        assert_eq!(since.timestamp(), T0 / 1_000_000_000);
    }

    #[test]
    fn test_replayed_events_are_forwarded_once() {
        let mut cursor = earlier_cursor();
        assert!(cursor.admit(&message_at("c1", "start", T0)));
        assert!(cursor.admit(&message_at("c1", "die", T0 + 10)));
        assert!(cursor.admit(&message_at("c2", "die", T0 + 10)));

        // Replay after reconnect, from the start of the second
        assert!(!cursor.admit(&message_at("c0", "die", T0 - 5)));
        assert!(!cursor.admit(&message_at("c1", "start", T0)));
        assert!(!cursor.admit(&message_at("c1", "die", T0 + 10)));
        assert!(!cursor.admit(&message_at("c2", "die", T0 + 10)));

        // Emitted while detached
        assert!(cursor.admit(&message_at("c3", "die", T0 + 10)));
        assert!(cursor.admit(&message_at("c1", "destroy", T0 + 20)));
    }

    #[test]
    fn test_events_before_construction_are_skipped() {
        let start = DateTime::from_timestamp(T0 / 1_000_000_000, 0).unwrap();
        let mut cursor = FeedCursor::starting_at(start);

        assert!(!cursor.admit(&message_at("c1", "die", T0 - 1)));
        assert!(cursor.admit(&message_at("c1", "die", T0 + 1)));
    }
}
