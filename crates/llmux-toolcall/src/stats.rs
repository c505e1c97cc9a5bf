use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{ErrorCode, Event, EventType, Hook, Status};

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub total_events: i64,
    pub by_event_type: HashMap<EventType, i64>,
    pub by_tool: HashMap<String, i64>,
    pub by_status: HashMap<Status, i64>,
    pub by_error_code: HashMap<ErrorCode, i64>,
    pub duplicate_events: i64,
}

impl StatsSnapshot {
    pub fn sorted_tool_names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.by_tool.keys().cloned().collect();
        out.sort();
        out
    }
}

#[derive(Default)]
struct StatsInner {
    total: i64,
    by_event: HashMap<EventType, i64>,
    by_tool: HashMap<String, i64>,
    by_status: HashMap<Status, i64>,
    by_error: HashMap<ErrorCode, i64>,
    duplicates: i64,
}

/// Hook that counts lifecycle events by type, tool, status and error code.
#[derive(Default)]
pub struct StatsHook {
    inner: Mutex<StatsInner>,
}

impl StatsHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().expect("stats hook lock");
        StatsSnapshot {
            total_events: inner.total,
            by_event_type: inner.by_event.clone(),
            by_tool: inner.by_tool.clone(),
            by_status: inner.by_status.clone(),
            by_error_code: inner.by_error.clone(),
            duplicate_events: inner.duplicates,
        }
    }
}

impl Hook for StatsHook {
    fn on_tool_event(&self, event: &Event) {
        let mut inner = self.inner.lock().expect("stats hook lock");
        inner.total += 1;
        *inner.by_event.entry(event.event_type).or_default() += 1;
        if !event.tool_name.is_empty() {
            *inner.by_tool.entry(event.tool_name.clone()).or_default() += 1;
        }
        if let Some(status) = event.status {
            *inner.by_status.entry(status).or_default() += 1;
        }
        if let Some(code) = event.error_code {
            *inner.by_error.entry(code).or_default() += 1;
        }
        if event.duplicate {
            inner.duplicates += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_counts_events() {
        let hook = StatsHook::new();
        let mut event = Event::new(EventType::Start, "echo", "c1");
        event.status = Some(Status::Started);
        hook.on_tool_event(&event);

        let mut dup = Event::new(EventType::Duplicate, "echo", "c1");
        dup.duplicate = true;
        dup.error_code = Some(ErrorCode::DuplicateInFlight);
        hook.on_tool_event(&dup);

        let snapshot = hook.snapshot();
        assert_eq!(snapshot.total_events, 2);
        assert_eq!(snapshot.by_tool.get("echo"), Some(&2));
        assert_eq!(snapshot.duplicate_events, 1);
        assert_eq!(
            snapshot.by_error_code.get(&ErrorCode::DuplicateInFlight),
            Some(&1)
        );
        assert_eq!(snapshot.sorted_tool_names(), vec!["echo"]);
    }
}
