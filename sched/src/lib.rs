// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The pipeline scheduler: static job lists run by pinned per-core threads.
//!
//! Each core owns a list of jobs. Slave cores run a tight
//! `while online { run every job }` loop on a thread pinned to that core;
//! the master core runs one job per [`JobBoard::run_master_round`] call so
//! the process can reconfigure between rounds. Job management is legal only
//! from the master thread and only while the target core is stopped — both
//! are asserted, as misuse is a programming error, not a runtime condition.
//!
//! Device removal (vhost unplug) uses a two-phase flag per core: the master
//! raises `REQUEST` on every online core and spins until each pipeline,
//! from inside its job loop, acknowledges. Only then is the device unlinked.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Jobs per core, as in the original static tables.
pub const MAX_JOBS_PER_CORE: usize = 32;

const ACK_REMOVAL: u8 = 0;
const REQUEST_REMOVAL: u8 = 1;

/// One scheduled unit: a closure run once per loop iteration.
pub type Job = Box<dyn FnMut() + Send>;

/// Errors from job management.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedError {
    #[error("core {0} has no slot on this board")]
    BadCore(usize),
    #[error("core {0} already holds {MAX_JOBS_PER_CORE} jobs")]
    TooManyJobs(usize),
}

struct CoreInner {
    jobs: Vec<Job>,
    handle: Option<JoinHandle<()>>,
    master_cursor: usize,
}

struct CoreSlot {
    online: AtomicBool,
    removal: AtomicU8,
    inner: Mutex<CoreInner>,
}

impl CoreSlot {
    fn new() -> CoreSlot {
        CoreSlot {
            online: AtomicBool::new(false),
            removal: AtomicU8::new(ACK_REMOVAL),
            inner: Mutex::new(CoreInner {
                jobs: Vec::new(),
                handle: None,
                master_cursor: usize::MAX,
            }),
        }
    }
}

/// Per-core job lists for one data plane process.
///
/// Construct on the master thread; that thread is the only one allowed to
/// manage jobs or core lifecycles.
pub struct JobBoard {
    cores: Box<[CoreSlot]>,
    master_core: usize,
    master_thread: ThreadId,
}

fn pin_current_thread(core: usize) {
    let mut set = nix::sched::CpuSet::new();
    if set.set(core).is_err() {
        warn!(core, "core id beyond CpuSet range, thread left unpinned");
        return;
    }
    if let Err(err) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set) {
        warn!(core, %err, "sched_setaffinity failed, thread left unpinned");
    }
}

impl JobBoard {
    /// A board for cores `0..n_cores` with `master_core` reserved for the
    /// calling thread.
    ///
    /// # Panics
    ///
    /// When `master_core` is not on the board.
    #[must_use]
    pub fn new(n_cores: usize, master_core: usize) -> Arc<JobBoard> {
        assert!(master_core < n_cores, "master core {master_core} out of range");
        Arc::new(JobBoard {
            cores: (0..n_cores).map(|_| CoreSlot::new()).collect(),
            master_core,
            master_thread: std::thread::current().id(),
        })
    }

    fn assert_master(&self) {
        assert_eq!(
            std::thread::current().id(),
            self.master_thread,
            "job management is master-thread only"
        );
    }

    fn slot(&self, core: usize) -> Result<&CoreSlot, SchedError> {
        self.cores.get(core).ok_or(SchedError::BadCore(core))
    }

    fn assert_stopped(&self, core: usize) {
        let slot = &self.cores[core];
        assert!(
            core == self.master_core || !slot.online.load(Ordering::Acquire),
            "core {core} is running"
        );
    }

    /// Number of cores on the board.
    #[must_use]
    pub fn n_cores(&self) -> usize {
        self.cores.len()
    }

    /// The reserved master core id.
    #[must_use]
    pub fn master_core(&self) -> usize {
        self.master_core
    }

    /// Append a job to a stopped core's list.
    ///
    /// # Errors
    ///
    /// [`SchedError`] for unknown cores or full lists.
    ///
    /// # Panics
    ///
    /// Off-master callers and running target cores.
    pub fn add_job(&self, core: usize, job: Job) -> Result<(), SchedError> {
        self.assert_master();
        let slot = self.slot(core)?;
        self.assert_stopped(core);
        let mut inner = slot.inner.lock();
        if inner.jobs.len() >= MAX_JOBS_PER_CORE {
            return Err(SchedError::TooManyJobs(core));
        }
        inner.jobs.push(job);
        Ok(())
    }

    /// Drop every job on a stopped core.
    ///
    /// # Errors
    ///
    /// [`SchedError::BadCore`].
    ///
    /// # Panics
    ///
    /// Off-master callers and running target cores.
    pub fn clear(&self, core: usize) -> Result<(), SchedError> {
        self.assert_master();
        let slot = self.slot(core)?;
        self.assert_stopped(core);
        slot.inner.lock().jobs.clear();
        Ok(())
    }

    /// Jobs currently installed on a core.
    #[must_use]
    pub fn nb_jobs(&self, core: usize) -> usize {
        self.cores.get(core).map_or(0, |slot| slot.inner.lock().jobs.len())
    }

    /// Launch a slave core's loop on a pinned thread. Idempotent for an
    /// already-running core.
    ///
    /// # Errors
    ///
    /// [`SchedError::BadCore`], and I/O errors from thread spawning.
    ///
    /// # Panics
    ///
    /// Off-master callers and attempts to launch the master core.
    pub fn launch(self: &Arc<Self>, core: usize) -> Result<(), SchedError> {
        self.assert_master();
        assert_ne!(core, self.master_core, "master core runs via run_master_round");
        let slot = self.slot(core)?;
        let mut inner = slot.inner.lock();
        if slot.online.load(Ordering::Acquire) && inner.handle.is_some() {
            return Ok(());
        }
        slot.online.store(true, Ordering::Release);
        let jobs = std::mem::take(&mut inner.jobs);
        let board = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("uswitch-core-{core}"))
            .spawn(move || board.slave_loop(core, jobs))
            .unwrap_or_else(|err| panic!("cannot spawn core {core} thread: {err}"));
        inner.handle = Some(handle);
        debug!(core, "launched slave core");
        Ok(())
    }

    fn slave_loop(&self, core: usize, mut jobs: Vec<Job>) {
        pin_current_thread(core);
        let slot = &self.cores[core];
        while slot.online.load(Ordering::Acquire) {
            for job in &mut jobs {
                job();
            }
        }
        // hand the list back for the next launch
        slot.inner.lock().jobs = jobs;
        debug!(core, "slave core exited job loop");
    }

    /// Stop a slave core and block until its thread leaves the job loop.
    ///
    /// # Errors
    ///
    /// [`SchedError::BadCore`].
    ///
    /// # Panics
    ///
    /// Off-master callers.
    pub fn stop(&self, core: usize) -> Result<(), SchedError> {
        self.assert_master();
        let slot = self.slot(core)?;
        slot.online.store(false, Ordering::Release);
        let handle = slot.inner.lock().handle.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Launch every slave core.
    ///
    /// # Panics
    ///
    /// As for [`JobBoard::launch`].
    pub fn launch_all(self: &Arc<Self>) {
        for core in 0..self.cores.len() {
            if core != self.master_core {
                let _ = self.launch(core);
            }
        }
    }

    /// Stop every slave core, blocking until each exits.
    pub fn stop_all(&self) {
        for core in 0..self.cores.len() {
            if core != self.master_core {
                let _ = self.stop(core);
            }
        }
    }

    /// Run one master-core job (round-robin across the list), permitting
    /// reconfiguration between rounds.
    ///
    /// # Panics
    ///
    /// Off-master callers.
    pub fn run_master_round(&self) {
        self.assert_master();
        let slot = &self.cores[self.master_core];
        let mut inner = slot.inner.lock();
        if inner.jobs.is_empty() {
            return;
        }
        let next = inner.master_cursor.wrapping_add(1) % inner.jobs.len();
        inner.master_cursor = next;
        let mut job = inner.jobs.remove(next);
        drop(inner);
        job();
        let mut inner = slot.inner.lock();
        let at = next.min(inner.jobs.len());
        inner.jobs.insert(at, job);
    }

    /// Pipeline-side acknowledgement: called from inside a job when the
    /// master has requested device removal.
    pub fn ack_removal(&self, core: usize) {
        if let Some(slot) = self.cores.get(core) {
            let _ = slot.removal.compare_exchange(
                REQUEST_REMOVAL,
                ACK_REMOVAL,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// True when the master has asked this core to quiesce.
    #[must_use]
    pub fn removal_requested(&self, core: usize) -> bool {
        self.cores
            .get(core)
            .is_some_and(|slot| slot.removal.load(Ordering::Acquire) == REQUEST_REMOVAL)
    }

    /// Raise `REQUEST` on every online core and spin until each pipeline
    /// acknowledges. After return it is safe to unlink the device.
    ///
    /// # Panics
    ///
    /// Off-master callers.
    pub fn request_removal_and_wait(&self) {
        self.assert_master();
        let online: Vec<usize> = (0..self.cores.len())
            .filter(|core| self.cores[*core].online.load(Ordering::Acquire))
            .collect();
        for core in &online {
            self.cores[*core]
                .removal
                .store(REQUEST_REMOVAL, Ordering::Release);
        }
        for core in &online {
            while self.cores[*core].removal.load(Ordering::Acquire) == REQUEST_REMOVAL {
                core::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn launched_job_runs_at_least_once() {
        let board = JobBoard::new(2, 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        board
            .add_job(1, Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        board.launch(1).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        board.stop(1).unwrap();
        assert!(hits.load(Ordering::Relaxed) >= 1);
        // list survives the stop for a relaunch
        assert_eq!(board.nb_jobs(1), 1);
    }

    #[test]
    fn clear_leaves_no_jobs() {
        let board = JobBoard::new(2, 0);
        board.add_job(1, Box::new(|| {})).unwrap();
        board.add_job(1, Box::new(|| {})).unwrap();
        assert_eq!(board.nb_jobs(1), 2);
        board.clear(1).unwrap();
        assert_eq!(board.nb_jobs(1), 0);
    }

    #[test]
    fn job_list_capacity_is_enforced() {
        let board = JobBoard::new(2, 0);
        for _ in 0..MAX_JOBS_PER_CORE {
            board.add_job(1, Box::new(|| {})).unwrap();
        }
        assert_eq!(
            board.add_job(1, Box::new(|| {})).unwrap_err(),
            SchedError::TooManyJobs(1)
        );
    }

    #[test]
    fn master_round_runs_jobs_round_robin() {
        let board = JobBoard::new(1, 0);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = Arc::clone(&order);
            board
                .add_job(0, Box::new(move || order.lock().push(tag)))
                .unwrap();
        }
        for _ in 0..6 {
            board.run_master_round();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn removal_handshake_completes() {
        let board = JobBoard::new(2, 0);
        let inner = Arc::clone(&board);
        board
            .add_job(1, Box::new(move || {
                if inner.removal_requested(1) {
                    inner.ack_removal(1);
                }
            }))
            .unwrap();
        board.launch(1).unwrap();
        board.request_removal_and_wait();
        board.stop(1).unwrap();
    }

    #[test]
    fn stop_of_never_launched_core_is_fine() {
        let board = JobBoard::new(3, 0);
        board.stop(2).unwrap();
        assert_eq!(board.stop(9).unwrap_err(), SchedError::BadCore(9));
    }
}
