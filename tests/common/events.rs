//! Helpers replaying manager events

use dataset_fetch::{DatasetId, Event, JobStatus};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::TryRecvError;

/// Everything currently buffered in `events`
pub fn drain(events: &mut Receiver<Event>) -> Vec<Event> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(TryRecvError::Lagged(skipped)) => panic!("event receiver lagged by {skipped}"),
            Err(_) => return drained,
        }
    }
}

/// Highest number of jobs that were `downloading` at the same time
pub fn max_concurrently_downloading(events: &[Event]) -> usize {
    let mut downloading: HashSet<(DatasetId, String)> = HashSet::new();
    let mut peak = 0;
    for event in events {
        if let Event::JobStatusChanged {
            dataset_id,
            uri,
            status,
        } = event
        {
            let key = (*dataset_id, uri.clone());
            match status {
                JobStatus::Downloading => {
                    downloading.insert(key);
                    peak = peak.max(downloading.len());
                }
                JobStatus::Succeeded | JobStatus::Failed => {
                    downloading.remove(&key);
                }
                _ => {}
            }
        }
    }
    peak
}

/// `(acquired, released)` slot events
pub fn slot_counts(events: &[Event]) -> (usize, usize) {
    events.iter().fold((0, 0), |(acquired, released), event| match event {
        Event::SlotAcquired { .. } => (acquired + 1, released),
        Event::SlotReleased { .. } => (acquired, released + 1),
        _ => (acquired, released),
    })
}

pub fn count_matching(events: &[Event], predicate: impl Fn(&Event) -> bool) -> usize {
    events.iter().filter(|event| predicate(event)).count()
}

/// Wait until a job of `dataset_id` reports `status`
pub async fn wait_for_status(
    events: &mut Receiver<Event>,
    dataset_id: DatasetId,
    status: JobStatus,
    timeout: Duration,
) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::JobStatusChanged {
                    dataset_id: id,
                    status: seen,
                    ..
                }) if id == dataset_id && seen == status => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}
