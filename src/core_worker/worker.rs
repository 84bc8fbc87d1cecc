use crate::config::{ClientConfig, ExistingTarget};
use crate::constants::OPEN_FILE_RETRY_DELAY_MS;
use crate::core_cache::ListingCache;
use crate::core_disk::OpenFiles;
use crate::core_error::FtpError;
use crate::core_log::SessionLogs;
use crate::core_network::{CommandOptions, ConnectParams, ControlConnection};
use crate::core_queue::{ItemState, ItemUid, OperationQueue, ProblemCode, QueueItem};
use crate::core_reply::FtpReply;
use crate::core_worker::classifier::TransferModeClassifier;
use crate::core_worker::flows::{self, ItemFlow};
use crate::core_worker::state::{Job, Outcome, WorkerState, WorkerStatus};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Services shared by all workers of one server.
#[derive(Clone)]
pub struct WorkerContext {
    pub params: ConnectParams,
    pub config: Arc<ClientConfig>,
    pub queue: Arc<dyn OperationQueue>,
    pub cache: Arc<ListingCache>,
    pub open_files: OpenFiles,
    pub logs: Arc<SessionLogs>,
}

/// Control side of a running worker.
pub struct WorkerHandle {
    id: usize,
    status: watch::Receiver<WorkerStatus>,
    cancel: CancellationToken,
    reconnect: Arc<Notify>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.clone()
    }

    /// Stops the worker. A command in progress is aborted and its item goes
    /// back to the queue.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Leaves `ConnectionError`; ignored in any other state.
    pub fn reconnect(&self) {
        if matches!(*self.status.borrow(), WorkerStatus::ConnectionError { .. }) {
            self.reconnect.notify_one();
        }
    }

    /// Waits until the published status satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl FnMut(&WorkerStatus) -> bool) -> WorkerStatus {
        let mut status = self.status.clone();
        let reached = match status.wait_for(predicate).await {
            Ok(current) => (*current).clone(),
            Err(_) => WorkerStatus::Stopped,
        };
        reached
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Worker {} ended abnormally: {}", self.id, e);
        }
    }
}

/// Executes queue items one at a time over its own control connection.
pub struct Worker {
    id: usize,
    ctx: WorkerContext,
    classifier: TransferModeClassifier,
    conn: Option<ControlConnection>,
    status: watch::Sender<WorkerStatus>,
    cancel: CancellationToken,
    reconnect: Arc<Notify>,
    work: watch::Receiver<u64>,
}

impl Worker {
    /// Starts a worker task on the current runtime.
    pub fn spawn(id: usize, ctx: WorkerContext) -> WorkerHandle {
        Self::spawn_with_shutdown(id, ctx, &CancellationToken::new())
    }

    /// Starts a worker that also stops when `shutdown` is cancelled.
    pub fn spawn_with_shutdown(id: usize, ctx: WorkerContext, shutdown: &CancellationToken) -> WorkerHandle {
        let (status_tx, status_rx) = watch::channel(WorkerStatus::LookingForWork);
        let cancel = shutdown.child_token();
        let reconnect = Arc::new(Notify::new());
        let worker = Worker {
            id,
            classifier: TransferModeClassifier::from_config(&ctx.config.transfer),
            work: ctx.queue.subscribe(),
            ctx,
            conn: None,
            status: status_tx,
            cancel: cancel.clone(),
            reconnect: Arc::clone(&reconnect),
        };
        let task = tokio::spawn(worker.run());
        WorkerHandle {
            id,
            status: status_rx,
            cancel,
            reconnect,
            task,
        }
    }

    /// Attempts allowed per item: the configured retries plus the first try.
    fn budget(&self) -> u32 {
        self.ctx.config.connection.connect_retries.saturating_add(1)
    }

    async fn run(mut self) {
        info!("Worker {} started", self.id);
        let mut state = WorkerState::LookingForWork;
        loop {
            if matches!(state, WorkerState::Stopped) {
                break;
            }
            self.status.send_replace(state.status());
            state = self.step(state).await;
        }
        if let Some(conn) = self.conn.take() {
            if conn.is_connected() {
                let _ = conn.quit().await;
            }
        }
        self.status.send_replace(WorkerStatus::Stopped);
        info!("Worker {} stopped", self.id);
    }

    async fn step(&mut self, state: WorkerState) -> WorkerState {
        if self.cancel.is_cancelled() {
            return self.stop_with(state);
        }
        match state {
            WorkerState::LookingForWork => self.look_for_work(),
            WorkerState::Sleeping => self.sleep().await,
            WorkerState::Preparing(item) => self.prepare(item).await,
            WorkerState::Connecting { job, attempts } => self.connect(job, attempts).await,
            WorkerState::WaitingForReconnect { job, attempts, .. } => self.reconnect_delay(job, attempts).await,
            WorkerState::Working { job, attempts } => self.work(job, attempts).await,
            WorkerState::ConnectionError { error } => self.connection_error(error).await,
            WorkerState::Stopped => WorkerState::Stopped,
        }
    }

    fn requeue(&self, uid: ItemUid) {
        self.ctx.queue.update_item_state(uid, ItemState::Waiting, None, None);
    }

    /// Hands back the item held in `state`.
    fn stop_with(&mut self, state: WorkerState) -> WorkerState {
        match state {
            WorkerState::Preparing(item) => self.requeue(item.uid),
            WorkerState::Connecting { job, .. }
            | WorkerState::WaitingForReconnect { job, .. }
            | WorkerState::Working { job, .. } => self.requeue(job.item.uid),
            _ => {}
        }
        WorkerState::Stopped
    }

    fn report(&self, item: &QueueItem, outcome: Outcome) {
        let queue = &self.ctx.queue;
        match outcome {
            Outcome::Done => {
                info!("{} done", item);
                queue.update_item_state(item.uid, ItemState::Done, None, None);
            }
            Outcome::Skipped { problem, detail } => {
                info!("{} skipped: {}", item, detail);
                queue.update_item_state(item.uid, ItemState::Skipped, Some(problem), Some(detail));
            }
            Outcome::Failed { problem, detail } => {
                warn!("{} failed: {}", item, detail);
                queue.update_item_state(item.uid, ItemState::Failed, Some(problem), Some(detail));
            }
            Outcome::Replaced(children) => queue.replace_item_with_children(item.uid, children),
        }
    }

    fn look_for_work(&mut self) -> WorkerState {
        // Anything queued after this point wakes the sleep below.
        self.work.borrow_and_update();
        match self.ctx.queue.next_waiting_item() {
            Some(item) => {
                debug!("Worker {} took {}", self.id, item);
                WorkerState::Preparing(item)
            }
            None => WorkerState::Sleeping,
        }
    }

    async fn sleep(&mut self) -> WorkerState {
        let wake_at = self.ctx.queue.next_delayed_wakeup();
        let delayed = async move {
            match wake_at {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            changed = self.work.changed() => {
                if changed.is_err() {
                    return WorkerState::Stopped;
                }
            }
            _ = delayed => {}
            _ = self.cancel.cancelled() => {}
        }
        WorkerState::LookingForWork
    }

    async fn prepare(&mut self, item: QueueItem) -> WorkerState {
        if item.kind.is_local_only() {
            let outcome = flows::remove_local_dir(&item).await;
            self.report(&item, outcome);
            return WorkerState::LookingForWork;
        }

        let mut job = Job::new(item);
        job.transfer = self.classifier.transfer_type(&job.item.name);
        if job.item.kind.is_download() {
            let Some(target) = job.item.local_path() else {
                let outcome = Outcome::Failed {
                    problem: ProblemCode::Unexpected,
                    detail: "no local target".into(),
                };
                self.report(&job.item, outcome);
                return WorkerState::LookingForWork;
            };
            match self.ctx.open_files.try_claim(&target) {
                Some(claim) => job.claim = Some(claim),
                None => {
                    debug!("{} is being written by another worker", target.display());
                    let until = Instant::now() + Duration::from_millis(OPEN_FILE_RETRY_DELAY_MS);
                    self.ctx.queue.delay_item(job.item.uid, until);
                    return WorkerState::LookingForWork;
                }
            }
            if let Ok(existing) = tokio::fs::metadata(&target).await {
                match self.ctx.config.transfer.existing_target {
                    ExistingTarget::Skip => {
                        let outcome = Outcome::Skipped {
                            problem: ProblemCode::TargetExists,
                            detail: format!("{} already exists", target.display()),
                        };
                        self.report(&job.item, outcome);
                        return WorkerState::LookingForWork;
                    }
                    ExistingTarget::Resume if existing.len() > 0 => job.resume_from = Some(existing.len()),
                    _ => {}
                }
            }
        }
        WorkerState::Connecting { job, attempts: 0 }
    }

    fn connection(&mut self) -> Result<ControlConnection, FtpError> {
        if let Some(conn) = &self.conn {
            return Ok(conn.clone());
        }
        let conn = ControlConnection::new(self.ctx.params.clone(), Arc::clone(&self.ctx.logs))?;
        self.conn = Some(conn.clone());
        Ok(conn)
    }

    async fn connect(&mut self, job: Job, attempts: u32) -> WorkerState {
        let attempts = attempts + 1;
        let conn = match self.connection() {
            Ok(conn) => conn,
            Err(e) => {
                self.requeue(job.item.uid);
                return WorkerState::ConnectionError { error: e.to_string() };
            }
        };
        if conn.is_connected() {
            return WorkerState::Working { job, attempts };
        }

        debug!("Worker {} connecting, attempt {} of {}", self.id, attempts, self.budget());
        let result = tokio::select! {
            result = conn.connect() => result,
            _ = self.cancel.cancelled() => Err(FtpError::Cancelled),
        };
        match result {
            Ok(_) => WorkerState::Working { job, attempts },
            Err(FtpError::Cancelled) => WorkerState::Connecting {
                job,
                attempts: attempts - 1,
            },
            Err(e) if e.is_transient() && attempts < self.budget() => {
                warn!("Worker {}: connect attempt {} failed: {}", self.id, attempts, e);
                WorkerState::WaitingForReconnect {
                    job,
                    attempts,
                    error: e.to_string(),
                }
            }
            Err(e) => {
                warn!("Worker {}: giving up connecting: {}", self.id, e);
                self.requeue(job.item.uid);
                WorkerState::ConnectionError { error: e.to_string() }
            }
        }
    }

    async fn reconnect_delay(&mut self, job: Job, attempts: u32) -> WorkerState {
        let delay = Duration::from_secs(self.ctx.config.connection.delay_between_retries_secs);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
        WorkerState::Connecting { job, attempts }
    }

    async fn work(&mut self, mut job: Job, attempts: u32) -> WorkerState {
        let Some(conn) = self.conn.clone() else {
            return WorkerState::Connecting { job, attempts };
        };
        let opts = CommandOptions::with_cancel(self.cancel.child_token());
        let result = ItemFlow::new(&self.ctx, &conn, opts).run(&mut job).await;
        match result {
            Ok(outcome) => self.report(&job.item, outcome),
            Err(FtpError::Cancelled) if self.cancel.is_cancelled() => {
                return self.stop_with(WorkerState::Working { job, attempts });
            }
            Err(e) if e.is_transient() && attempts < self.budget() => {
                warn!("Worker {}: {} interrupted: {}", self.id, job.item, e);
                return WorkerState::WaitingForReconnect {
                    job,
                    attempts,
                    error: e.to_string(),
                };
            }
            Err(e) => {
                let detail = e.reply().map(FtpReply::text).unwrap_or_else(|| e.to_string());
                let outcome = Outcome::Failed {
                    problem: ProblemCode::from_error(&e),
                    detail,
                };
                self.report(&job.item, outcome);
            }
        }
        WorkerState::LookingForWork
    }

    async fn connection_error(&mut self, error: String) -> WorkerState {
        tokio::select! {
            _ = self.reconnect.notified() => {
                info!("Worker {} reconnecting after: {}", self.id, error);
                if let Some(conn) = self.conn.take() {
                    conn.close().await;
                }
                WorkerState::LookingForWork
            }
            _ = self.cancel.cancelled() => WorkerState::Stopped,
        }
    }
}
