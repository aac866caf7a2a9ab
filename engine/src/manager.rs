//! Sync manager - drives sync states through their lifecycle.
//!
//! ```text
//! NEW ──run──► RUNNING ──┬──► DONE
//!   ▲                    ├──► FAILED
//!   └─────(re)run────────┴──► STOPPED
//! ```
//!
//! Runs execute on spawned tokio tasks. At most one run per sync id is in
//! flight; a second `run_sync` fails fast with [`Error::AlreadyRunning`].
//! Stopping is cooperative: the flag is checked between pages and batches,
//! so the page in flight always completes first.

use crate::rest::RestClient;
use crate::store::now_millis;
use crate::sync_state::{SyncOptions, SyncState, SyncStatus, SyncTarget};
use crate::target::down::SyncDownTarget;
use crate::target::up::{AdvancedSyncUpTarget, SyncUpOutcome, SyncUpTarget};
use crate::target::SyncContext;
use crate::{error::Result, Error, SoupStore, SyncId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Invoked with the sync state after every persisted change of a run.
pub type SyncCallback = Arc<dyn Fn(&SyncState) + Send + Sync>;

/// Whether the manager accepts new runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    AcceptingSyncs,
    /// Running syncs were asked to stop; no new run starts
    StopRequested,
    Stopped,
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Done,
    Stopped,
}

struct Inner {
    store: Arc<SoupStore>,
    rest: Arc<dyn RestClient>,
    /// Stop flags of the runs in flight
    active: DashMap<SyncId, Arc<AtomicBool>>,
    state: Mutex<ManagerState>,
    advanced: DashMap<String, Arc<dyn AdvancedSyncUpTarget>>,
}

/// Orchestrates the syncs of one user's store.
///
/// Cheap to clone; clones share the same runs.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("state", &*self.inner.state.lock())
            .field("active", &self.inner.active.len())
            .finish()
    }
}

/// Releases the in-progress marker of a run, even if its task panics.
struct ActiveRun {
    inner: Arc<Inner>,
    sync_id: SyncId,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.inner.active.remove(&self.sync_id);
        let mut state = self.inner.state.lock();
        if *state == ManagerState::StopRequested && self.inner.active.is_empty() {
            *state = ManagerState::Stopped;
            info!("sync manager stopped");
        }
    }
}

impl SyncManager {
    /// Create a manager over `store`, registering the syncs soup if needed.
    pub fn new(store: Arc<SoupStore>, rest: Arc<dyn RestClient>) -> Result<Self> {
        SyncState::setup_syncs_soup(&store)?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                rest,
                active: DashMap::new(),
                state: Mutex::new(ManagerState::AcceptingSyncs),
                advanced: DashMap::new(),
            }),
        })
    }

    pub fn store(&self) -> &Arc<SoupStore> {
        &self.inner.store
    }

    /// Make an advanced sync up implementation available under `name`.
    pub fn register_advanced_target(
        &self,
        name: impl Into<String>,
        target: Arc<dyn AdvancedSyncUpTarget>,
    ) {
        self.inner.advanced.insert(name.into(), target);
    }

    // ------------------------------------------------------------------
    // Sync records
    // ------------------------------------------------------------------

    /// Persist a new sync in status NEW without running it.
    ///
    /// The target is validated and the soups it writes must exist. Names
    /// are unique.
    pub fn record_sync(
        &self,
        target: SyncTarget,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> Result<SyncState> {
        target.validate()?;
        for soup in soups_written(&target, soup_name) {
            if !self.inner.store.soup_exists(soup) {
                return Err(Error::SoupNotFound(soup.to_string()));
            }
        }
        if let SyncTarget::Up(SyncUpTarget::Advanced(advanced)) = &target {
            if !self.inner.advanced.contains_key(&advanced.name) {
                return Err(Error::InvalidSyncConfig(format!(
                    "no advanced target named '{}'",
                    advanced.name
                )));
            }
        }
        if let Some(name) = name {
            if self.has_sync_with_name(name)? {
                return Err(Error::InvalidSyncConfig(format!(
                    "a sync named '{}' already exists",
                    name
                )));
            }
        }

        let mut state = SyncState::new(target, options, soup_name, name.map(String::from));
        state.save(&self.inner.store)?;
        info!(
            sync_id = state.id,
            soup = soup_name,
            sync_type = state.sync_type().as_str(),
            "recorded sync"
        );
        Ok(state)
    }

    pub fn create_sync_down(
        &self,
        target: SyncDownTarget,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> Result<SyncState> {
        self.record_sync(SyncTarget::Down(target), options, soup_name, name)
    }

    pub fn create_sync_up(
        &self,
        target: SyncUpTarget,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> Result<SyncState> {
        self.record_sync(SyncTarget::Up(target), options, soup_name, name)
    }

    pub fn get_sync_status(&self, sync_id: SyncId) -> Result<Option<SyncState>> {
        SyncState::load(&self.inner.store, sync_id)
    }

    pub fn get_sync_status_by_name(&self, name: &str) -> Result<Option<SyncState>> {
        SyncState::load_by_name(&self.inner.store, name)
    }

    pub fn has_sync_with_name(&self, name: &str) -> Result<bool> {
        Ok(self.get_sync_status_by_name(name)?.is_some())
    }

    pub fn all_syncs(&self) -> Result<Vec<SyncState>> {
        SyncState::load_all(&self.inner.store)
    }

    fn load(&self, sync_id: SyncId) -> Result<SyncState> {
        self.get_sync_status(sync_id)?
            .ok_or_else(|| Error::SyncNotFound(sync_id.to_string()))
    }

    fn id_for_name(&self, name: &str) -> Result<SyncId> {
        self.get_sync_status_by_name(name)?
            .map(|state| state.id)
            .ok_or_else(|| Error::SyncNotFound(name.to_string()))
    }

    /// Delete a sync record. Records it synced are kept.
    pub fn delete_sync(&self, sync_id: SyncId) -> Result<()> {
        if self.is_running(sync_id) {
            return Err(Error::AlreadyRunning(sync_id));
        }
        self.load(sync_id)?;
        SyncState::delete(&self.inner.store, sync_id)?;
        info!(sync_id, "deleted sync");
        Ok(())
    }

    pub fn delete_sync_by_name(&self, name: &str) -> Result<()> {
        self.delete_sync(self.id_for_name(name)?)
    }

    /// Mark a sync FAILED, e.g. one found RUNNING after a restart.
    pub fn mark_failed(&self, sync_id: SyncId, reason: &str) -> Result<SyncState> {
        if self.is_running(sync_id) {
            return Err(Error::AlreadyRunning(sync_id));
        }
        let mut state = self.load(sync_id)?;
        state.status = SyncStatus::Failed;
        state.error = Some(reason.to_string());
        state.end_time = now_millis();
        state.save(&self.inner.store)?;
        warn!(sync_id, reason, "sync marked failed");
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    pub fn is_running(&self, sync_id: SyncId) -> bool {
        self.inner.active.contains_key(&sync_id)
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.lock()
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == ManagerState::StopRequested
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ManagerState::Stopped
    }

    /// Start a run of `sync_id` on a background task.
    ///
    /// A sync down resumes from its stored `maxTimeStamp`. The returned
    /// handle resolves to the final state once the run ends.
    pub fn run_sync(
        &self,
        sync_id: SyncId,
        callback: Option<SyncCallback>,
    ) -> Result<JoinHandle<Result<SyncState>>> {
        let stop = Arc::new(AtomicBool::new(false));
        {
            // Held across the claim so `stop` either sees this run or refuses it
            let manager_state = self.inner.state.lock();
            if *manager_state != ManagerState::AcceptingSyncs {
                return Err(Error::ManagerStopped);
            }
            match self.inner.active.entry(sync_id) {
                Entry::Occupied(_) => return Err(Error::AlreadyRunning(sync_id)),
                Entry::Vacant(slot) => {
                    slot.insert(stop.clone());
                }
            }
        }
        let claim = ActiveRun {
            inner: self.inner.clone(),
            sync_id,
        };

        let mut state = self.load(sync_id)?;
        state.status = SyncStatus::Running;
        state.progress = 0;
        state.start_time = now_millis();
        state.end_time = 0;
        state.error = None;
        state.save(&self.inner.store)?;
        notify(&callback, &state);
        info!(sync_id, soup = %state.soup_name, sync_type = state.sync_type().as_str(), "sync started");

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let _claim = claim;
            execute(&inner, state, &stop, &callback).await
        }))
    }

    /// Run a sync again by id. Sync downs fetch only what changed since
    /// the last run.
    pub fn re_sync(
        &self,
        sync_id: SyncId,
        callback: Option<SyncCallback>,
    ) -> Result<JoinHandle<Result<SyncState>>> {
        self.run_sync(sync_id, callback)
    }

    pub fn re_sync_by_name(
        &self,
        name: &str,
        callback: Option<SyncCallback>,
    ) -> Result<JoinHandle<Result<SyncState>>> {
        self.run_sync(self.id_for_name(name)?, callback)
    }

    /// Ask a running sync to stop after its current page. Returns whether
    /// the sync was running.
    pub fn stop_sync(&self, sync_id: SyncId) -> bool {
        match self.inner.active.get(&sync_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(sync_id, "stop requested");
                true
            }
            None => false,
        }
    }

    /// Stop every running sync and refuse new runs until [`restart`].
    ///
    /// [`restart`]: SyncManager::restart
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        for entry in self.inner.active.iter() {
            entry.value().store(true, Ordering::SeqCst);
        }
        *state = if self.inner.active.is_empty() {
            ManagerState::Stopped
        } else {
            ManagerState::StopRequested
        };
        info!(state = ?*state, "sync manager stop requested");
    }

    /// Accept runs again, optionally re-running the syncs left STOPPED.
    pub fn restart(
        &self,
        restart_stopped_syncs: bool,
        callback: Option<SyncCallback>,
    ) -> Result<Vec<JoinHandle<Result<SyncState>>>> {
        {
            let mut state = self.inner.state.lock();
            if *state == ManagerState::StopRequested {
                return Err(Error::InvalidSyncState(
                    "sync manager is still stopping".into(),
                ));
            }
            *state = ManagerState::AcceptingSyncs;
        }
        info!("sync manager restarted");

        let mut handles = Vec::new();
        if restart_stopped_syncs {
            for state in self.all_syncs()? {
                if state.is_stopped() {
                    handles.push(self.run_sync(state.id, callback.clone())?);
                }
            }
        }
        Ok(handles)
    }

    /// Remove ghost records of a sync down outside of a run.
    pub async fn clean_resync_ghosts(&self, sync_id: SyncId) -> Result<usize> {
        let state = self.load(sync_id)?;
        let Some(target) = state.down_target() else {
            return Err(Error::NotASyncDown(sync_id));
        };
        if self.is_running(sync_id) {
            return Err(Error::AlreadyRunning(sync_id));
        }
        let ctx = SyncContext::new(
            &self.inner.store,
            self.inner.rest.as_ref(),
            sync_id,
            &state.soup_name,
            &state.options,
        );
        let removed = target.clean_ghosts(&ctx).await?;
        info!(sync_id, records = removed, "cleaned ghosts");
        Ok(removed)
    }
}

/// Soups a target writes into.
fn soups_written<'a>(target: &'a SyncTarget, soup_name: &'a str) -> Vec<&'a str> {
    match target {
        SyncTarget::Down(SyncDownTarget::ParentChildren(t)) => {
            vec![t.parent.soup_name.as_str(), t.children.soup_name.as_str()]
        }
        SyncTarget::Up(SyncUpTarget::ParentChildren(t)) => {
            vec![t.parent.soup_name.as_str(), t.children.soup_name.as_str()]
        }
        _ => vec![soup_name],
    }
}

fn notify(callback: &Option<SyncCallback>, state: &SyncState) {
    if let Some(callback) = callback {
        callback(state);
    }
}

fn progress_of(processed: usize, total: i64) -> i32 {
    if total <= 0 {
        return 0;
    }
    ((processed as i64 * 100) / total).clamp(0, 99) as i32
}

/// Persist a mid-run state and report it.
fn checkpoint(inner: &Inner, state: &mut SyncState, callback: &Option<SyncCallback>) -> Result<()> {
    state.save(&inner.store)?;
    notify(callback, state);
    Ok(())
}

async fn execute(
    inner: &Inner,
    mut state: SyncState,
    stop: &AtomicBool,
    callback: &Option<SyncCallback>,
) -> Result<SyncState> {
    let result = match state.target.clone() {
        SyncTarget::Down(target) => sync_down(inner, &mut state, &target, stop, callback).await,
        SyncTarget::Up(target) => sync_up(inner, &mut state, &target, stop, callback).await,
    };

    match result {
        Ok(RunEnd::Done) => {
            state.status = SyncStatus::Done;
            state.progress = 100;
            info!(sync_id = state.id, total = state.total_size, "sync done");
        }
        Ok(RunEnd::Stopped) => {
            state.status = SyncStatus::Stopped;
            info!(sync_id = state.id, progress = state.progress, "sync stopped");
        }
        Err(e) => {
            state.status = SyncStatus::Failed;
            state.error = Some(e.to_string());
            error!(sync_id = state.id, error = %e, "sync failed");
        }
    }
    state.end_time = now_millis();
    state.save(&inner.store)?;
    notify(callback, &state);
    Ok(state)
}

async fn sync_down(
    inner: &Inner,
    state: &mut SyncState,
    target: &SyncDownTarget,
    stop: &AtomicBool,
    callback: &Option<SyncCallback>,
) -> Result<RunEnd> {
    let soup_name = state.soup_name.clone();
    let options = state.options.clone();
    let ctx = SyncContext::new(
        &inner.store,
        inner.rest.as_ref(),
        state.id,
        &soup_name,
        &options,
    );
    let sorted = target.is_sorted_by_modification();
    let mut max_time_stamp = state.max_time_stamp;

    let mut page = target.start_fetch(&ctx, state.max_time_stamp).await?;
    state.total_size = page.total_size.unwrap_or(-1);
    let mut fetched = 0;
    loop {
        max_time_stamp = max_time_stamp.max(target.latest_modification_time_stamp(&page.records));
        fetched += page.records.len();
        target.save_records(&ctx, page.records)?;

        if sorted {
            state.max_time_stamp = max_time_stamp;
        }
        state.progress = progress_of(fetched, state.total_size);
        checkpoint(inner, state, callback)?;
        debug!(
            sync_id = state.id,
            records = fetched,
            progress = state.progress,
            "sync down page saved"
        );

        let Some(continuation) = page.continuation else {
            break;
        };
        if stop.load(Ordering::SeqCst) {
            return Ok(RunEnd::Stopped);
        }
        page = target.continue_fetch(&ctx, &continuation).await?;
    }
    state.max_time_stamp = max_time_stamp;

    if options.clean_ghosts {
        let removed = target.clean_ghosts(&ctx).await?;
        debug!(sync_id = state.id, records = removed, "cleaned ghosts after sync down");
    }
    Ok(RunEnd::Done)
}

async fn sync_up(
    inner: &Inner,
    state: &mut SyncState,
    target: &SyncUpTarget,
    stop: &AtomicBool,
    callback: &Option<SyncCallback>,
) -> Result<RunEnd> {
    let advanced = match target {
        SyncUpTarget::Advanced(config) => Some(
            inner
                .advanced
                .get(&config.name)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| {
                    Error::InvalidSyncConfig(format!(
                        "no advanced target named '{}'",
                        config.name
                    ))
                })?,
        ),
        _ => None,
    };

    let soup_name = state.soup_name.clone();
    let options = state.options.clone();
    let ctx = SyncContext::new(
        &inner.store,
        inner.rest.as_ref(),
        state.id,
        &soup_name,
        &options,
    );

    let records = target.dirty_records(&ctx)?;
    state.total_size = records.len() as i64;
    let batch_size = target.max_batch_size(advanced.as_deref());
    let mut remaining = records.into_iter();
    let mut processed = 0;
    let mut conflicts = 0;
    let mut last_error = None;

    loop {
        let batch: Vec<_> = remaining.by_ref().take(batch_size).collect();
        if batch.is_empty() {
            break;
        }
        if processed > 0 && stop.load(Ordering::SeqCst) {
            state.error = last_error;
            return Ok(RunEnd::Stopped);
        }
        processed += batch.len();
        for outcome in target
            .sync_up_batch(&ctx, batch, advanced.as_deref())
            .await?
        {
            match outcome {
                SyncUpOutcome::Applied => {}
                SyncUpOutcome::Conflict => conflicts += 1,
                SyncUpOutcome::Failed(message) => last_error = Some(message),
            }
        }
        state.progress = progress_of(processed, state.total_size);
        checkpoint(inner, state, callback)?;
        debug!(
            sync_id = state.id,
            records = processed,
            conflicts,
            progress = state.progress,
            "sync up batch pushed"
        );
    }

    if conflicts > 0 {
        warn!(sync_id = state.id, conflicts, "records left dirty after conflicts");
    }
    state.error = last_error;
    Ok(RunEnd::Done)
}

