// Journaux de session par connexion de contrôle

use chrono::Local;
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

pub type LogUid = u64;

struct SessionLog {
    title: String,
    lines: VecDeque<String>,
    closed: bool,
}

struct LogsState {
    logs: HashMap<LogUid, SessionLog>,
    closed_order: VecDeque<LogUid>,
}

pub struct SessionLogs {
    next_uid: AtomicU64,
    max_lines: usize,
    max_closed: usize,
    state: Mutex<LogsState>,
}

impl SessionLogs {
    pub fn new(max_lines: usize, max_closed: usize) -> Self {
        Self {
            next_uid: AtomicU64::new(1),
            max_lines: max_lines.max(1),
            max_closed,
            state: Mutex::new(LogsState {
                logs: HashMap::new(),
                closed_order: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a new log and returns its uid.
    pub fn open(&self, title: &str) -> LogUid {
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        self.lock().logs.insert(
            uid,
            SessionLog {
                title: title.to_string(),
                lines: VecDeque::new(),
                closed: false,
            },
        );
        uid
    }

    /// Appends one line; unknown uids are ignored.
    pub fn append(&self, uid: LogUid, text: &str) {
        let line = format!("{} {}", Local::now().format("%H:%M:%S"), text.trim_end());
        trace!("[log {}] {}", uid, line);
        let mut state = self.lock();
        if let Some(log) = state.logs.get_mut(&uid) {
            log.lines.push_back(line);
            while log.lines.len() > self.max_lines {
                log.lines.pop_front();
            }
        }
    }

    /// Marks a log closed; the oldest closed logs are dropped past the limit.
    pub fn close(&self, uid: LogUid) {
        let mut state = self.lock();
        match state.logs.get_mut(&uid) {
            Some(log) if !log.closed => log.closed = true,
            _ => return,
        }
        state.closed_order.push_back(uid);
        while state.closed_order.len() > self.max_closed {
            if let Some(old) = state.closed_order.pop_front() {
                state.logs.remove(&old);
            }
        }
    }

    pub fn lines(&self, uid: LogUid) -> Vec<String> {
        self.lock()
            .logs
            .get(&uid)
            .map(|log| log.lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn title(&self, uid: LogUid) -> Option<String> {
        self.lock().logs.get(&uid).map(|log| log.title.clone())
    }

    pub fn is_open(&self, uid: LogUid) -> bool {
        self.lock().logs.get(&uid).map_or(false, |log| !log.closed)
    }
}

impl Default for SessionLogs {
    fn default() -> Self {
        Self::new(
            crate::constants::SESSION_LOG_MAX_LINES,
            crate::constants::SESSION_LOG_MAX_CLOSED,
        )
    }
}
