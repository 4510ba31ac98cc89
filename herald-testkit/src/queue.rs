use std::time::Duration;

use herald::{JobEvent, JobId, JobRecord, JobState, JobStore};
use tokio::sync::broadcast;

const POLL: Duration = Duration::from_millis(5);

/// Poll `store` until job `id` reaches `state`. Returns the record, or
/// `None` on timeout.
pub async fn wait_for_state<S>(store: &S, id: JobId, state: JobState, timeout: Duration) -> Option<JobRecord>
where
    S: JobStore + ?Sized,
{
    tokio::time::timeout(timeout, async {
        loop {
            if let Ok(Some(record)) = store.get(id).await {
                if record.state == state {
                    return record;
                }
            }
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .ok()
}

/// Receive events until one matches `predicate`. Lagged receivers skip
/// ahead. Returns `None` on timeout or a closed channel.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<JobEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<JobEvent>
where
    F: FnMut(&JobEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Everything currently buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
