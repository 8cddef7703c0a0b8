//! Lifecycle state machine shared by every pipeline stage.
//!
//! ```text
//!  <- no thread | thread ->
//!               |          start()           run()
//!   Stopped ----+--> WaitingToPause --> Paused <--> WaitingToRun --> Running
//!               |                         ^                            |
//!               |                         +------ WaitingToPause <-----+  pause()
//!               |         stop(): any state --> WaitingToStop --> Stopped
//! ```
//!
//! The three `WaitingTo*` states are one-shot bridges where a stage builds up
//! or tears down whatever its resting state needs. The worker thread is
//! created by `start()` and joined by `stop()`.
//!
//! The state lock is held across callback dispatch so a stage mutates its own
//! state atomically with the machine; callbacks must do bounded work per call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

/// Poll interval for control-side transition waits.
const TRANSITION_POLL: Duration = Duration::from_micros(10);

/// Linux limits thread names to 15 bytes plus the terminator.
const MAX_NAME_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    WaitingToPause,
    Paused,
    WaitingToRun,
    Running,
    WaitingToStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker already started")]
    AlreadyStarted,
    #[error("operation not valid in state {0:?}")]
    BadState(State),
    #[error("failed to spawn stage thread")]
    Spawn,
    /// A stage callback returned an error and the worker shut itself down.
    #[error("stage failed and stopped")]
    StageFailed,
}

/// The four per-stage callbacks driven by the lifecycle loop.
///
/// `waiting_to_run` runs once before `Running`, `waiting_to_halt` once before
/// `Paused` or `Stopped`. `running` and `paused` are invoked repeatedly in
/// their resting states with a `yield_time` sleep between invocations. Any
/// callback error stops the worker immediately.
pub trait Stage: Send + 'static {
    fn waiting_to_run(&mut self) -> anyhow::Result<()>;
    fn running(&mut self) -> anyhow::Result<()>;
    fn paused(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn waiting_to_halt(&mut self) -> anyhow::Result<()>;
}

struct Shared {
    state: Mutex<State>,
    yield_time_us: AtomicU64,
}

impl Shared {
    fn state(&self) -> State {
        *self.state.lock()
    }
}

/// Control handle for one stage thread.
pub struct Worker {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
    name: String,
    priority: i32,
}

impl Worker {
    pub fn new(yield_time_us: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Stopped),
                yield_time_us: AtomicU64::new(yield_time_us),
            }),
            thread: None,
            name: String::new(),
            priority: 0,
        }
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the worker (and its thread, where the OS allows renaming a
    /// running thread).
    pub fn set_name(&mut self, name: &str) {
        self.name = name.chars().take(MAX_NAME_LEN).collect();
        #[cfg(target_os = "linux")]
        if let Some(handle) = &self.thread {
            use std::os::unix::thread::JoinHandleExt;
            if let Ok(cname) = std::ffi::CString::new(self.name.clone()) {
                let rc = unsafe { libc::pthread_setname_np(handle.as_pthread_t(), cname.as_ptr()) };
                if rc != 0 {
                    debug!("failed to rename thread (rc {rc})");
                }
            }
        }
    }

    pub fn yield_time_us(&self) -> u64 {
        self.shared.yield_time_us.load(Ordering::Relaxed)
    }

    pub fn set_yield_time_us(&self, us: u64) {
        self.shared.yield_time_us.store(us, Ordering::Relaxed);
    }

    /// Spawns the stage thread and blocks until it parks in `Paused`.
    pub fn start<S: Stage>(
        &mut self,
        stage: S,
        name: &str,
        priority: i32,
    ) -> Result<(), WorkerError> {
        {
            let mut st = self.shared.state.lock();
            if *st != State::Stopped {
                return Err(WorkerError::AlreadyStarted);
            }
            *st = State::WaitingToPause;
        }

        self.name = name.chars().take(MAX_NAME_LEN).collect();
        let shared = Arc::clone(&self.shared);
        let handle = match thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || drive(shared, stage))
        {
            Ok(handle) => handle,
            Err(_) => {
                *self.shared.state.lock() = State::Stopped;
                return Err(WorkerError::Spawn);
            }
        };

        self.priority = priority;
        set_rt_priority(&handle, priority);
        self.thread = Some(handle);

        self.wait_for(State::Paused)
    }

    /// Moves `Paused → Running`; a no-op when already running.
    pub fn run(&self) -> Result<(), WorkerError> {
        {
            let mut st = self.shared.state.lock();
            match *st {
                State::Running => return Ok(()),
                State::Paused => *st = State::WaitingToRun,
                other => return Err(WorkerError::BadState(other)),
            }
        }
        self.wait_for(State::Running)
    }

    /// Moves `Running → Paused`; a no-op when already paused.
    pub fn pause(&self) -> Result<(), WorkerError> {
        {
            let mut st = self.shared.state.lock();
            match *st {
                State::Paused => return Ok(()),
                State::Running => *st = State::WaitingToPause,
                other => return Err(WorkerError::BadState(other)),
            }
        }
        self.wait_for(State::Paused)
    }

    /// Stops from any state and joins the thread; a no-op when already
    /// stopped.
    pub fn stop(&mut self) -> Result<(), WorkerError> {
        {
            let mut st = self.shared.state.lock();
            if *st != State::Stopped {
                *st = State::WaitingToStop;
            }
        }
        // Ignore StageFailed here: either way the thread is parked in
        // Stopped and only needs joining.
        let _ = self.wait_for(State::Stopped);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
        if let Some(handle) = &self.thread {
            set_rt_priority(handle, priority);
        }
    }

    /// Polls until the machine reaches `target`. A worker that died on a
    /// callback error parks in `Stopped`, which unblocks waiters with
    /// `StageFailed` instead of hanging them.
    fn wait_for(&self, target: State) -> Result<(), WorkerError> {
        loop {
            let state = self.shared.state();
            if state == target {
                return Ok(());
            }
            if state == State::Stopped {
                return Err(WorkerError::StageFailed);
            }
            thread::sleep(TRANSITION_POLL);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn drive<S: Stage>(shared: Arc<Shared>, mut stage: S) {
    loop {
        {
            let mut st = shared.state.lock();
            let outcome = match *st {
                State::WaitingToRun => stage.waiting_to_run().map(|()| {
                    *st = State::Running;
                }),
                State::Running => stage.running(),
                State::WaitingToPause => stage.waiting_to_halt().map(|()| {
                    *st = State::Paused;
                }),
                State::Paused => stage.paused(),
                State::WaitingToStop => stage.waiting_to_halt().map(|()| {
                    *st = State::Stopped;
                }),
                State::Stopped => break,
            };
            if let Err(err) = outcome {
                error!("stage failed: {err:#}");
                *st = State::Stopped;
                break;
            }
            if *st == State::Stopped {
                break;
            }
        }
        thread::sleep(Duration::from_micros(
            shared.yield_time_us.load(Ordering::Relaxed),
        ));
    }
}

/// Real-time round-robin scheduling for a stage thread. Needs CAP_SYS_NICE;
/// failure is logged and ignored.
#[cfg(unix)]
fn set_rt_priority(handle: &thread::JoinHandle<()>, priority: i32) {
    use std::os::unix::thread::JoinHandleExt;

    if priority <= 0 {
        return;
    }
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc = unsafe {
        libc::pthread_setschedparam(handle.as_pthread_t(), libc::SCHED_RR, &param)
    };
    if rc != 0 {
        debug!("failed to set thread scheduling (rc {rc})");
    }
}

#[cfg(not(unix))]
fn set_rt_priority(_handle: &thread::JoinHandle<()>, _priority: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    #[derive(Default)]
    struct Counters {
        setup: AtomicU32,
        ticks: AtomicU32,
        idle: AtomicU32,
        halt: AtomicU32,
    }

    struct CountingStage {
        counters: Arc<Counters>,
        fail_setup: bool,
    }

    impl Stage for CountingStage {
        fn waiting_to_run(&mut self) -> anyhow::Result<()> {
            if self.fail_setup {
                anyhow::bail!("setup refused");
            }
            self.counters.setup.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn running(&mut self) -> anyhow::Result<()> {
            self.counters.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn paused(&mut self) -> anyhow::Result<()> {
            self.counters.idle.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn waiting_to_halt(&mut self) -> anyhow::Result<()> {
            self.counters.halt.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spawn(fail_setup: bool) -> (Worker, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let mut worker = Worker::new(100);
        worker
            .start(
                CountingStage {
                    counters: Arc::clone(&counters),
                    fail_setup,
                },
                "counting",
                0,
            )
            .unwrap();
        (worker, counters)
    }

    #[test]
    fn full_lifecycle() {
        let (mut worker, counters) = spawn(false);
        assert_eq!(worker.state(), State::Paused);

        worker.run().unwrap();
        assert_eq!(worker.state(), State::Running);
        thread::sleep(Duration::from_millis(10));
        assert!(counters.ticks.load(Ordering::SeqCst) > 1);
        assert_eq!(counters.setup.load(Ordering::SeqCst), 1);

        worker.pause().unwrap();
        assert_eq!(worker.state(), State::Paused);
        // waiting_to_halt ran once for the pause transition.
        assert_eq!(counters.halt.load(Ordering::SeqCst), 2);

        worker.stop().unwrap();
        assert_eq!(worker.state(), State::Stopped);
        assert_eq!(counters.halt.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn transitions_are_idempotent() {
        let (mut worker, _) = spawn(false);
        worker.run().unwrap();
        worker.run().unwrap();
        worker.pause().unwrap();
        worker.pause().unwrap();
        worker.stop().unwrap();
        worker.stop().unwrap();
        assert_eq!(worker.state(), State::Stopped);
    }

    #[test]
    fn start_twice_is_refused() {
        let (mut worker, counters) = spawn(false);
        let again = worker.start(
            CountingStage {
                counters: Arc::clone(&counters),
                fail_setup: false,
            },
            "again",
            0,
        );
        assert_eq!(again, Err(WorkerError::AlreadyStarted));
        worker.stop().unwrap();
    }

    #[test]
    fn run_from_stopped_is_bad_state() {
        let worker = Worker::new(100);
        assert_eq!(worker.run(), Err(WorkerError::BadState(State::Stopped)));
        assert_eq!(worker.pause(), Err(WorkerError::BadState(State::Stopped)));
    }

    #[test]
    fn restart_after_stop() {
        let (mut worker, _) = spawn(false);
        worker.stop().unwrap();

        let counters = Arc::new(Counters::default());
        worker
            .start(
                CountingStage {
                    counters: Arc::clone(&counters),
                    fail_setup: false,
                },
                "second",
                0,
            )
            .unwrap();
        assert_eq!(worker.state(), State::Paused);
        worker.stop().unwrap();
    }

    #[test]
    fn setup_failure_parks_in_stopped() {
        let (mut worker, counters) = spawn(true);
        assert_eq!(worker.run(), Err(WorkerError::StageFailed));
        assert_eq!(worker.state(), State::Stopped);
        assert_eq!(counters.setup.load(Ordering::SeqCst), 0);
        worker.stop().unwrap();
    }

    struct TickOnce {
        fired: Arc<AtomicBool>,
    }

    impl Stage for TickOnce {
        fn waiting_to_run(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn running(&mut self) -> anyhow::Result<()> {
            self.fired.store(true, Ordering::SeqCst);
            anyhow::bail!("done after one tick");
        }
        fn waiting_to_halt(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn running_failure_stops_worker() {
        let fired = Arc::new(AtomicBool::new(false));
        let mut worker = Worker::new(100);
        worker
            .start(
                TickOnce {
                    fired: Arc::clone(&fired),
                },
                "tick-once",
                0,
            )
            .unwrap();
        // The first tick can fail before run() observes Running, so either
        // outcome of run() is legitimate here.
        let _ = worker.run();
        // The failing tick parks the worker in Stopped on its own.
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while worker.state() != State::Stopped && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(worker.state(), State::Stopped);
        worker.stop().unwrap();
    }
}
