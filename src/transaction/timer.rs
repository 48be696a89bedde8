use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};
use tokio::time::Instant;

struct TimerTable<T> {
    tasks: BTreeMap<(Instant, u64), T>,
    deadlines: HashMap<u64, Instant>,
}

/// Deadline-ordered task table shared by every transaction of an
/// endpoint. Uses the tokio clock so a paused runtime drives it.
pub struct Timer<T> {
    table: Mutex<TimerTable<T>>,
    last_task_id: AtomicU64,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            table: Mutex::new(TimerTable {
                tasks: BTreeMap::new(),
                deadlines: HashMap::new(),
            }),
            last_task_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.tasks.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, execute_at: Instant, value: T) -> u64 {
        let task_id = self.last_task_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut table) = self.table.lock() {
            table.tasks.insert((execute_at, task_id), value);
            table.deadlines.insert(task_id, execute_at);
        }
        task_id
    }

    pub fn cancel(&self, task_id: u64) -> Option<T> {
        let mut table = self.table.lock().ok()?;
        let execute_at = table.deadlines.remove(&task_id)?;
        table.tasks.remove(&(execute_at, task_id))
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let table = self.table.lock().ok()?;
        table.tasks.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return every task due at or before `now`, oldest first.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let Ok(mut table) = self.table.lock() else {
            return vec![];
        };
        let due = table
            .tasks
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        let mut result = Vec::with_capacity(due.len());
        for key in due {
            table.deadlines.remove(&key.1);
            if let Some(value) = table.tasks.remove(&key) {
                result.push(value);
            }
        }
        result
    }
}
