//! Bounded concurrent execution of a plan.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use twinpane_core::{EngineConfig, ErrorKind, OperationError};

use crate::conflict::{AskOutcome, BatchResolver, Conflict, Decision};
use crate::operation::{ItemState, OperationItem, OperationKind};
use crate::plan::{apply_decision, fail_item, Action, Plan, Step};
use crate::progress::{OperationProgress, ProgressSink, Throttle};
use crate::transfer::{
    copy_file, copy_symlink, delete_dir, delete_file, make_dir, move_entry, move_tree,
    CopyContext, StepError, StepResult,
};

/// Forced end state for an item that will not run.
#[derive(Debug)]
enum Settle {
    Skip,
    Fail(OperationError),
    Cancel,
}

/// What a worker needs to run one item.
struct Work {
    step: Step,
    source: PathBuf,
    destination: Option<PathBuf>,
    size: u64,
}

/// Shared state of one running batch.
///
/// The items, the reserved destinations and the aggregate counters sit
/// behind one mutex. Sink callbacks run after the lock is released.
pub(crate) struct Batch {
    config: EngineConfig,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    resolver: Arc<BatchResolver>,
    state: Mutex<BatchState>,
}

struct BatchState {
    items: Vec<OperationItem>,
    steps: Vec<Step>,
    reserved: HashSet<PathBuf>,
    progress: OperationProgress,
}

impl BatchState {
    fn new(
        kind: OperationKind,
        items: Vec<OperationItem>,
        steps: Vec<Step>,
        reserved: HashSet<PathBuf>,
    ) -> Self {
        let bytes_total = items
            .iter()
            .filter(|i| !i.is_dir())
            .map(OperationItem::size_bytes)
            .sum();
        let progress = OperationProgress::new(kind, items.len(), bytes_total);
        Self {
            items,
            steps,
            reserved,
            progress,
        }
    }
}

impl Batch {
    fn new(
        config: EngineConfig,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
        resolver: Arc<BatchResolver>,
        state: BatchState,
    ) -> Self {
        Self {
            config,
            sink,
            cancel,
            resolver,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_taken(&self, path: &Path) -> bool {
        self.lock().reserved.contains(path) || std::fs::symlink_metadata(path).is_ok()
    }

    fn state_of(&self, idx: usize) -> ItemState {
        self.lock().items[idx].state()
    }

    fn emit_terminal(&self, item: OperationItem, progress: OperationProgress) {
        tracing::debug!(
            id = item.id(),
            state = %item.state(),
            path = %item.source().display(),
            "Item finished"
        );
        self.sink.on_item_terminal(&item);
        self.sink.on_batch_progress(&progress);
    }

    /// Report items that became terminal while the plan was built.
    fn report_settled(&self) {
        let settled: Vec<OperationItem> = {
            let mut state = self.lock();
            let settled: Vec<OperationItem> =
                state.items.iter().filter(|i| i.is_terminal()).cloned().collect();
            for item in &settled {
                state.progress.finish_item(item);
            }
            settled
        };
        let progress = self.lock().progress.clone();
        for item in &settled {
            self.sink.on_item_terminal(item);
        }
        if !settled.is_empty() {
            self.sink.on_batch_progress(&progress);
        }
    }

    fn begin(&self, idx: usize) -> Option<Work> {
        let (item, work) = {
            let mut state = self.lock();
            let BatchState { items, steps, progress, .. } = &mut *state;
            let item = &mut items[idx];
            if let Err(e) = item.begin() {
                tracing::warn!(error = %e, "Item could not start");
                return None;
            }
            progress.set_current_file(Some(item.source().to_path_buf()));
            let work = Work {
                step: steps[idx].clone(),
                source: item.source().to_path_buf(),
                destination: item.destination().map(Path::to_path_buf),
                size: item.size_bytes(),
            };
            (item.clone(), work)
        };
        self.sink.on_progress(&item, 0, work.size);
        Some(work)
    }

    fn record_progress(&self, idx: usize, written: u64) {
        let (item, progress) = {
            let mut state = self.lock();
            let delta = state.items[idx].record_progress(written);
            if delta == 0 {
                return;
            }
            state.progress.add_bytes(delta);
            (state.items[idx].clone(), state.progress.clone())
        };
        self.sink
            .on_progress(&item, item.bytes_transferred(), item.size_bytes());
        self.sink.on_batch_progress(&progress);
    }

    /// Record the outcome of a step that ran.
    fn finish(&self, idx: usize, result: StepResult) {
        let result = match result {
            // A failure caused by cancellation is still a cancellation
            Err(StepError::Failed(_)) if self.cancel.is_cancelled() => Err(StepError::Cancelled),
            other => other,
        };

        let snapshot = {
            let mut state = self.lock();
            let BatchState { items, progress, .. } = &mut *state;
            let item = &mut items[idx];
            let transition = match result {
                Ok(()) => item.complete().map(|delta| progress.add_bytes(delta)),
                Err(StepError::Cancelled) => item.cancel(),
                Err(StepError::Failed(error)) => {
                    tracing::debug!(error = %error, "Item failed");
                    item.fail(error)
                }
            };
            match transition {
                Ok(()) => {
                    progress.finish_item(item);
                    Some((item.clone(), progress.clone()))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropped illegal transition");
                    None
                }
            }
        };

        if let Some((item, progress)) = snapshot {
            self.emit_terminal(item, progress);
        }
    }

    /// Finish the items carried along by a directory rename.
    fn finish_tree(&self, idx: usize, covered: Range<usize>, result: StepResult) {
        let failure = match &result {
            Ok(()) => None,
            Err(StepError::Cancelled) => Some(Settle::Cancel),
            Err(StepError::Failed(_)) if self.cancel.is_cancelled() => Some(Settle::Cancel),
            Err(StepError::Failed(error)) => Some(Settle::Fail(error.clone())),
        };
        self.finish(idx, result);

        for child in covered {
            match &failure {
                None => {
                    if self.begin(child).is_some() {
                        self.finish(child, Ok(()));
                    }
                }
                Some(Settle::Fail(error)) => {
                    let path = self.lock().items[child].source().to_path_buf();
                    self.settle(
                        child,
                        Settle::Fail(OperationError::new(
                            error.kind,
                            path,
                            "Not processed because its directory failed",
                        )),
                    );
                }
                Some(_) => self.settle(child, Settle::Cancel),
            }
        }
    }

    /// End an item without running it.
    fn settle(&self, idx: usize, settle: Settle) {
        let snapshot = {
            let mut state = self.lock();
            let BatchState { items, progress, .. } = &mut *state;
            let item = &mut items[idx];
            if item.is_terminal() {
                return;
            }
            let result = match settle {
                Settle::Skip => item.skip(),
                Settle::Cancel => item.cancel(),
                Settle::Fail(error) => {
                    fail_item(item, error);
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "Dropped illegal transition");
                return;
            }
            progress.finish_item(item);
            (item.clone(), progress.clone())
        };
        self.emit_terminal(snapshot.0, snapshot.1);
    }

    /// Apply an answer from the decision interface.
    ///
    /// Returns true if the item should now run.
    fn apply_answer(&self, idx: usize, conflict: &Conflict, decision: Decision) -> bool {
        let action = apply_decision(conflict, &decision, &|p: &Path| self.is_taken(p));
        tracing::debug!(path = %conflict.destination.display(), ?decision, "Conflict answered");

        let settle = {
            let mut state = self.lock();
            let BatchState { items, steps, reserved, .. } = &mut *state;
            items[idx].set_decision(decision);
            match action {
                Action::Proceed {
                    destination,
                    replace,
                } => {
                    steps[idx].set_overwrite(replace);
                    reserved.insert(destination.clone());
                    items[idx].set_destination(destination);
                    return true;
                }
                Action::Skip => Settle::Skip,
                Action::Fail(error) => Settle::Fail(error),
            }
        };
        self.settle(idx, settle);
        false
    }

    /// Cancel everything that has not reached a terminal state.
    fn cancel_remaining(&self) {
        let pending: Vec<usize> = {
            let state = self.lock();
            state
                .items
                .iter()
                .filter(|i| !i.is_terminal())
                .map(OperationItem::id)
                .collect()
        };
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Cancelling items that did not run");
        }
        for idx in pending {
            self.settle(idx, Settle::Cancel);
        }
    }

    fn into_items(self: Arc<Self>) -> Vec<OperationItem> {
        match Arc::try_unwrap(self) {
            Ok(batch) => {
                batch
                    .state
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .items
            }
            // A decision thread may still hold a reference
            Err(shared) => shared.lock().items.clone(),
        }
    }
}

/// Run one item on a blocking thread.
fn run_item(batch: &Batch, idx: usize) {
    if batch.cancel.is_cancelled() {
        batch.settle(idx, Settle::Cancel);
        return;
    }
    let Some(work) = batch.begin(idx) else {
        return;
    };
    if batch.cancel.is_cancelled() {
        batch.finish(idx, Err(StepError::Cancelled));
        return;
    }

    let ctx = CopyContext {
        config: &batch.config,
        cancel: &batch.cancel,
    };
    let mut throttle = Throttle::new(
        batch.config.progress_interval_bytes,
        batch.config.progress_interval,
    );
    let mut report = |written: u64| {
        if throttle.ready(written) {
            batch.record_progress(idx, written);
        }
    };

    let source = work.source.as_path();
    let result = match (&work.step, work.destination.as_deref()) {
        (Step::CopyFile { overwrite }, Some(dst)) => {
            copy_file(&ctx, source, dst, work.size, *overwrite, &mut report)
        }
        (Step::CopySymlink { overwrite }, Some(dst)) => copy_symlink(source, dst, *overwrite),
        (Step::MoveEntry { overwrite, same_volume }, Some(dst)) => move_entry(
            &ctx,
            source,
            dst,
            work.size,
            *overwrite,
            *same_volume,
            &mut report,
        ),
        (Step::MoveTree { .. }, Some(dst)) => move_tree(source, dst),
        (Step::MakeDir { create }, Some(dst)) => {
            if *create {
                make_dir(&batch.config, Some(source), dst).map_err(StepError::from)
            } else {
                Ok(())
            }
        }
        (Step::RemoveSourceDir { .. } | Step::DeleteDir, _) => delete_dir(source),
        (Step::DeleteFile, _) => delete_file(source),
        _ => Err(StepError::Failed(OperationError::new(
            ErrorKind::Io,
            source,
            "Item has nothing to execute",
        ))),
    };

    match work.step {
        Step::MoveTree { covered } => batch.finish_tree(idx, covered, result),
        _ => batch.finish(idx, result),
    }
}

/// Dependency bookkeeping for items that wait on their children.
struct Gates {
    parents: Vec<Option<usize>>,
    gated: Vec<bool>,
    outstanding: Vec<usize>,
    failed: Vec<usize>,
    skipped: Vec<bool>,
    cancelled: Vec<bool>,
}

impl Gates {
    fn new(parents: Vec<Option<usize>>, gated: Vec<bool>) -> Self {
        let n = parents.len();
        Self {
            parents,
            gated,
            outstanding: vec![0; n],
            failed: vec![0; n],
            skipped: vec![false; n],
            cancelled: vec![false; n],
        }
    }

    /// The gated parent that waits for `idx`, if any.
    fn waiter(&self, idx: usize) -> Option<usize> {
        self.parents[idx].filter(|p| self.gated[*p])
    }

    fn note_outcome(&mut self, parent: usize, state: ItemState) {
        match state {
            ItemState::Failed => self.failed[parent] += 1,
            ItemState::Skipped => self.skipped[parent] = true,
            ItemState::Cancelled => self.cancelled[parent] = true,
            _ => {}
        }
    }

    /// How a parent ends without running, given its children's outcomes.
    fn verdict(&self, parent: usize, path: &Path) -> Option<Settle> {
        if self.cancelled[parent] {
            Some(Settle::Cancel)
        } else if self.failed[parent] > 0 {
            Some(Settle::Fail(OperationError::new(
                ErrorKind::DirectoryNotEmpty,
                path,
                format!("{} entries inside could not be processed", self.failed[parent]),
            )))
        } else if self.skipped[parent] {
            Some(Settle::Skip)
        } else {
            None
        }
    }
}

/// Drives a batch to completion.
struct Scheduler {
    batch: Arc<Batch>,
    gates: Gates,
    ready: VecDeque<usize>,
}

impl Scheduler {
    fn new(batch: Arc<Batch>, parents: Vec<Option<usize>>, awaiting: &HashSet<usize>) -> Self {
        let (gated, live, covered): (Vec<bool>, Vec<Option<ItemState>>, Vec<bool>) = {
            let state = batch.lock();
            (
                state.steps.iter().map(Step::is_gated).collect(),
                state
                    .items
                    .iter()
                    .map(|i| Some(i.state()).filter(|s| !s.is_terminal()))
                    .collect(),
                state.steps.iter().map(|s| *s == Step::Covered).collect(),
            )
        };

        let mut scheduler = Self {
            batch,
            gates: Gates::new(parents, gated),
            ready: VecDeque::new(),
        };

        for idx in 0..live.len() {
            if let Some(parent) = scheduler.gates.waiter(idx) {
                match live[idx] {
                    Some(_) => scheduler.gates.outstanding[parent] += 1,
                    None => {
                        let state = scheduler.batch.state_of(idx);
                        scheduler.gates.note_outcome(parent, state);
                    }
                }
            }
        }

        for idx in 0..live.len() {
            if live[idx].is_none() || covered[idx] || awaiting.contains(&idx) {
                continue;
            }
            if scheduler.gates.gated[idx] && scheduler.gates.outstanding[idx] == 0 {
                scheduler.release(idx);
            } else if !scheduler.gates.gated[idx] {
                scheduler.ready.push_back(idx);
            }
        }

        scheduler
    }

    /// A gated item has no outstanding children: run it or settle it.
    fn release(&mut self, idx: usize) {
        let path = self.batch.lock().items[idx].source().to_path_buf();
        match self.gates.verdict(idx, &path) {
            Some(settle) => {
                self.batch.settle(idx, settle);
                self.on_terminal(idx);
            }
            None => self.ready.push_back(idx),
        }
    }

    /// Propagate a terminal item to the parent waiting for it.
    fn on_terminal(&mut self, idx: usize) {
        let Some(parent) = self.gates.waiter(idx) else {
            return;
        };
        let state = self.batch.state_of(idx);
        self.gates.note_outcome(parent, state);
        self.gates.outstanding[parent] = self.gates.outstanding[parent].saturating_sub(1);
        if self.gates.outstanding[parent] == 0 && !self.batch.state_of(parent).is_terminal() {
            self.release(parent);
        }
    }
}

/// Put queued conflicts to the decision interface one at a time.
///
/// Runs on its own blocking thread so workers keep going while the caller
/// thinks.
fn drain_decisions(
    batch: Arc<Batch>,
    asks: Vec<(usize, Conflict)>,
    answers: mpsc::UnboundedSender<(usize, Conflict, Decision)>,
) {
    for (idx, conflict) in asks {
        if batch.cancel.is_cancelled() {
            return;
        }
        match batch.resolver.ask(&conflict, &|p: &Path| batch.is_taken(p)) {
            AskOutcome::Decided(decision) => {
                if answers.send((idx, conflict, decision)).is_err() {
                    return;
                }
            }
            AskOutcome::Abort => {
                tracing::info!(path = %conflict.destination.display(), "Batch aborted at conflict");
                batch.cancel.cancel();
                return;
            }
        }
    }
}

/// Execute a prepared plan and return its items in plan order.
pub(crate) async fn run(
    kind: OperationKind,
    config: EngineConfig,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    resolver: Arc<BatchResolver>,
    plan: Plan,
) -> Vec<OperationItem> {
    let Plan {
        items,
        steps,
        parents,
        reserved,
        asks,
    } = plan;
    let limit = config.concurrency.max(1);
    let state = BatchState::new(kind, items, steps, reserved);
    let batch = Arc::new(Batch::new(config, sink, cancel, resolver, state));
    batch.report_settled();

    let awaiting: HashSet<usize> = asks.iter().map(|(idx, _)| *idx).collect();
    let mut scheduler = Scheduler::new(batch.clone(), parents, &awaiting);

    let (answer_tx, mut answer_rx) = mpsc::unbounded_channel();
    let mut unanswered = asks.len();
    if !asks.is_empty() {
        let decisions = batch.clone();
        tokio::task::spawn_blocking(move || drain_decisions(decisions, asks, answer_tx));
    }

    let mut workers = JoinSet::new();
    let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();

    loop {
        let cancelled = batch.cancel.is_cancelled();
        if !cancelled {
            while workers.len() < limit {
                let Some(idx) = scheduler.ready.pop_front() else {
                    break;
                };
                let worker = batch.clone();
                let handle = workers.spawn_blocking(move || run_item(&worker, idx));
                running.insert(handle.id(), idx);
            }
        }

        if workers.is_empty() && (cancelled || (unanswered == 0 && scheduler.ready.is_empty())) {
            break;
        }

        tokio::select! {
            Some(joined) = workers.join_next_with_id() => {
                let (id, failure) = match joined {
                    Ok((id, ())) => (id, None),
                    Err(e) => (e.id(), Some(e.to_string())),
                };
                if let Some(idx) = running.remove(&id) {
                    if let Some(message) = failure {
                        tracing::warn!(idx, %message, "Worker task failed");
                        let path = batch.lock().items[idx].source().to_path_buf();
                        batch.settle(idx, Settle::Fail(OperationError::new(ErrorKind::Io, path, message)));
                    }
                    scheduler.on_terminal(idx);
                }
            }
            answer = answer_rx.recv(), if unanswered > 0 => {
                match answer {
                    Some((idx, conflict, decision)) => {
                        unanswered -= 1;
                        if batch.apply_answer(idx, &conflict, decision) {
                            scheduler.ready.push_back(idx);
                        } else {
                            scheduler.on_terminal(idx);
                        }
                    }
                    // Decision thread stopped early (abort or cancel)
                    None => unanswered = 0,
                }
            }
            _ = batch.cancel.cancelled(), if !cancelled => {}
        }
    }

    drop(scheduler);
    batch.cancel_remaining();
    batch.into_items()
}
