use crate::core_queue::item::{ItemState, ItemUid, ProblemCode, QueueItem};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;

/// The queue as seen by workers.
///
/// Implementations serialize their own state; workers only ever hold copies
/// of items and report back through these calls.
pub trait OperationQueue: Send + Sync {
    /// Takes the next eligible item and marks it `Processing`.
    fn next_waiting_item(&self) -> Option<QueueItem>;

    fn update_item_state(
        &self,
        uid: ItemUid,
        state: ItemState,
        problem: Option<ProblemCode>,
        detail: Option<String>,
    );

    /// Replaces an explore item by its children, in place. Dependencies on the
    /// replaced item move to the children.
    fn replace_item_with_children(&self, uid: ItemUid, children: Vec<QueueItem>);

    /// Parks an item until `until`.
    fn delay_item(&self, uid: ItemUid, until: Instant);

    fn alloc_uid(&self) -> ItemUid;

    /// Bumped whenever new work may have become available.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Earliest moment a delayed item becomes eligible again.
    fn next_delayed_wakeup(&self) -> Option<Instant> {
        None
    }
}

pub struct InMemoryQueue {
    items: Mutex<Vec<QueueItem>>,
    next_uid: AtomicU64,
    signal: watch::Sender<u64>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            items: Mutex::new(Vec::new()),
            next_uid: AtomicU64::new(1),
            signal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.signal.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Appends a top-level item and returns its uid.
    pub fn add(&self, mut item: QueueItem) -> ItemUid {
        if item.uid == 0 {
            item.uid = self.alloc_uid();
        }
        let uid = item.uid;
        trace!("Queued {}", item);
        self.lock().push(item);
        self.notify();
        uid
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.lock().clone()
    }

    pub fn item(&self, uid: ItemUid) -> Option<QueueItem> {
        self.lock().iter().find(|item| item.uid == uid).cloned()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().iter().all(|item| item.state.is_finished())
    }

    /// Counts of items per final state: (done, skipped, failed).
    pub fn summary(&self) -> (usize, usize, usize) {
        let items = self.lock();
        let count = |f: &dyn Fn(ItemState) -> bool| items.iter().filter(|i| f(i.state)).count();
        (
            count(&|s| s == ItemState::Done),
            count(&|s| s == ItemState::Skipped),
            count(&|s| matches!(s, ItemState::Failed | ItemState::ForcedToFail)),
        )
    }

    pub async fn wait_until_finished(&self) {
        let mut changes = self.signal.subscribe();
        loop {
            if self.is_finished() {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}

impl OperationQueue for InMemoryQueue {
    fn next_waiting_item(&self) -> Option<QueueItem> {
        let now = Instant::now();
        let mut items = self.lock();
        let mut skipped_any = false;
        let mut found = None;

        for index in 0..items.len() {
            let eligible = match items[index].state {
                ItemState::Waiting => true,
                ItemState::Delayed => items[index].delayed_until.map_or(true, |at| at <= now),
                _ => false,
            };
            if !eligible {
                continue;
            }
            let states: HashMap<ItemUid, ItemState> =
                items.iter().map(|item| (item.uid, item.state)).collect();
            let deps = &items[index].depends_on;
            if deps
                .iter()
                .any(|uid| states.get(uid).map_or(false, |s| !s.is_finished()))
            {
                continue;
            }
            let failed_dep = deps
                .iter()
                .any(|uid| states.get(uid).map_or(false, |s| *s != ItemState::Done));
            let item = &mut items[index];
            if failed_dep {
                debug!("Skipping {}: an item inside failed", item);
                item.state = ItemState::Skipped;
                item.problem = Some(ProblemCode::ChildItemFailed);
                item.error_text = Some(ProblemCode::ChildItemFailed.to_string());
                skipped_any = true;
                continue;
            }
            item.state = ItemState::Processing;
            item.delayed_until = None;
            found = Some(item.clone());
            break;
        }
        drop(items);
        if skipped_any {
            self.notify();
        }
        found
    }

    fn update_item_state(
        &self,
        uid: ItemUid,
        state: ItemState,
        problem: Option<ProblemCode>,
        detail: Option<String>,
    ) {
        {
            let mut items = self.lock();
            if let Some(item) = items.iter_mut().find(|item| item.uid == uid) {
                trace!("{} -> {:?}", item, state);
                item.state = state;
                item.problem = problem;
                item.error_text = detail;
            }
        }
        self.notify();
    }

    fn replace_item_with_children(&self, uid: ItemUid, mut children: Vec<QueueItem>) {
        {
            let mut items = self.lock();
            let Some(index) = items.iter().position(|item| item.uid == uid) else {
                return;
            };
            for child in children.iter_mut() {
                if child.uid == 0 {
                    child.uid = self.alloc_uid();
                }
            }
            let child_uids: Vec<ItemUid> = children.iter().map(|child| child.uid).collect();
            for item in items.iter_mut() {
                if item.depends_on.contains(&uid) {
                    item.depends_on.retain(|dep| *dep != uid);
                    item.depends_on.extend(child_uids.iter().copied());
                }
            }
            debug!("Item {} expanded into {} items", uid, children.len());
            items.splice(index..=index, children);
        }
        self.notify();
    }

    fn delay_item(&self, uid: ItemUid, until: Instant) {
        {
            let mut items = self.lock();
            if let Some(item) = items.iter_mut().find(|item| item.uid == uid) {
                item.state = ItemState::Delayed;
                item.delayed_until = Some(until);
            }
        }
        self.notify();
    }

    fn alloc_uid(&self) -> ItemUid {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.signal.subscribe()
    }

    fn next_delayed_wakeup(&self) -> Option<Instant> {
        self.lock()
            .iter()
            .filter(|item| item.state == ItemState::Delayed)
            .filter_map(|item| item.delayed_until)
            .min()
    }
}
