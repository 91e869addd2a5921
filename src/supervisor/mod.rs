//! Master process: keeps `worker_num` worker processes alive.
//!
//! Signals drive the master's state:
//!
//! | signal          | action                                          |
//! |-----------------|-------------------------------------------------|
//! | SIGTERM, SIGINT | stop workers, SIGKILL after the grace window    |
//! | SIGHUP          | stop and respawn every worker                   |
//! | SIGUSR1         | forwarded to workers, which reload their handler|
//! | SIGUSR2         | log the worker table                            |
//! | SIGCHLD         | reap exited workers                             |
//!
//! Workers that crash are respawned after a random delay of up to
//! `max_splay`. A failed spawn stops everything, and so does a slot whose
//! worker keeps failing to start (`max_startup_failures` exits in a row,
//! each within `stable_after` of its spawn).

mod exit;
pub mod process;

pub use exit::{
    EXIT_CONNECT_ERROR, EXIT_FORK_FAILED, EXIT_MANUAL_KILL, EXIT_NORMAL, ExitStatusInfo, WorkerExit,
};
pub use process::{ChildProcesses, inherited_listener};

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use signal_hook::iterator::Signals;

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};

/// Signals the master registers for.
pub const HANDLED_SIGNALS: [libc::c_int; 6] = [
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGHUP,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGCHLD,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Running,
    Stopping,
}

/// Signals the master sends to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
    Reload,
}

impl Signal {
    pub const fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Reload => libc::SIGUSR1,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Reload => "SIGUSR1",
        })
    }
}

/// What the master does in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    Stop,
    Restart,
    Reload,
    Status,
    Reap,
}

impl SupervisorAction {
    pub const fn from_signal(signal: libc::c_int) -> Option<Self> {
        match signal {
            libc::SIGTERM | libc::SIGINT => Some(SupervisorAction::Stop),
            libc::SIGHUP => Some(SupervisorAction::Restart),
            libc::SIGUSR1 => Some(SupervisorAction::Reload),
            libc::SIGUSR2 => Some(SupervisorAction::Status),
            libc::SIGCHLD => Some(SupervisorAction::Reap),
            _ => None,
        }
    }
}

/// Process operations the supervisor needs.
pub trait ProcessControl {
    /// Start the worker for `slot`, returning its pid.
    fn spawn(&mut self, slot: usize) -> Result<u32>;

    fn signal(&mut self, pid: u32, signal: Signal) -> Result<()>;

    /// Collect every child that has exited since the last call. Never blocks.
    fn reap(&mut self) -> Vec<(u32, ExitStatusInfo)>;
}

/// One worker position.
#[derive(Debug, Clone, Default)]
pub struct WorkerSlot {
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub restarts: u32,
    pub last_exit: Option<WorkerExit>,
    /// Consecutive startup failures since the last stable run.
    pub startup_failures: u32,
    respawn_at: Option<Instant>,
    // Stopped on purpose by a restart cycle; respawn without delay.
    recycling: bool,
}

impl WorkerSlot {
    fn is_idle(&self) -> bool {
        self.pid.is_none() && self.respawn_at.is_none()
    }
}

pub struct Supervisor<P: ProcessControl> {
    control: P,
    config: SupervisorConfig,
    state: MasterState,
    slots: Vec<WorkerSlot>,
    stop_deadline: Option<Instant>,
    escalated: bool,
    failure: Option<Error>,
}

impl<P: ProcessControl> Supervisor<P> {
    pub fn new(control: P, config: SupervisorConfig) -> Self {
        let slots = vec![WorkerSlot::default(); config.worker_num];
        Self {
            control,
            config,
            state: MasterState::Running,
            slots,
            stop_deadline: None,
            escalated: false,
            failure: None,
        }
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn control(&self) -> &P {
        &self.control
    }

    /// A spawn failed, or a worker kept failing to start, and the
    /// supervisor is shutting down because of it.
    pub fn is_degraded(&self) -> bool {
        self.failure.is_some()
    }

    /// Spawn every worker.
    ///
    /// # Errors
    /// The first spawn failure; the supervisor is then `Stopping`.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        log::info!("starting {} worker(s)", self.slots.len());
        for slot in 0..self.slots.len() {
            self.spawn_slot(slot, now)?;
        }
        Ok(())
    }

    pub fn handle_signal(&mut self, action: SupervisorAction, now: Instant) {
        match action {
            SupervisorAction::Stop => self.begin_stop(now),
            SupervisorAction::Restart => self.restart_all(now),
            SupervisorAction::Reload => {
                log::info!("reloading worker handlers");
                self.signal_all(Signal::Reload);
            }
            SupervisorAction::Status => {
                for line in self.status_report(now).lines() {
                    log::info!("{}", line);
                }
            }
            SupervisorAction::Reap => self.reap(now),
        }
    }

    /// Reap, respawn and escalate as due. Returns `false` once there is
    /// nothing left to supervise.
    pub fn poll_once(&mut self, now: Instant) -> bool {
        self.reap(now);

        match self.state {
            MasterState::Running => {
                for slot in 0..self.slots.len() {
                    let due = self.slots[slot].pid.is_none()
                        && self.slots[slot].respawn_at.is_some_and(|at| at <= now);
                    if due {
                        if self.slots[slot].started_at.is_some() {
                            self.slots[slot].restarts += 1;
                        }
                        if self.spawn_slot(slot, now).is_err() {
                            break;
                        }
                    }
                }
                if self.state == MasterState::Running && self.slots.iter().all(WorkerSlot::is_idle) {
                    log::info!("all workers exited; nothing left to supervise");
                    return false;
                }
                true
            }
            MasterState::Stopping => {
                if self.slots.iter().all(|s| s.pid.is_none()) {
                    log::info!("all workers stopped");
                    return false;
                }
                if !self.escalated && self.stop_deadline.is_some_and(|at| now >= at) {
                    log::warn!(
                        "workers still running after {:?}; sending SIGKILL",
                        self.config.stop_grace
                    );
                    self.escalated = true;
                    self.signal_all(Signal::Kill);
                }
                true
            }
        }
    }

    /// Supervise until every worker has stopped.
    ///
    /// # Errors
    /// A worker could not be spawned.
    pub fn run(&mut self, signals: &mut Signals) -> Result<()> {
        if let Err(err) = self.start(Instant::now()) {
            log::error!("startup failed: {}", err);
        }
        loop {
            for signal in signals.pending() {
                if let Some(action) = SupervisorAction::from_signal(signal) {
                    log::debug!("master received signal {} ({:?})", signal, action);
                    self.handle_signal(action, Instant::now());
                }
            }
            if !self.poll_once(Instant::now()) {
                break;
            }
            thread::sleep(self.config.tick);
        }
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// One line per slot: pid, uptime, restart count, last exit.
    pub fn status_report(&self, now: Instant) -> String {
        let mut report = format!(
            "master {:?}, {} worker slot(s)\n",
            self.state,
            self.slots.len()
        );
        for (index, slot) in self.slots.iter().enumerate() {
            let line = match (slot.pid, slot.started_at) {
                (Some(pid), Some(started)) => format!(
                    "slot {}: pid {}, up {}s, restarts {}",
                    index,
                    pid,
                    now.saturating_duration_since(started).as_secs(),
                    slot.restarts
                ),
                _ => format!(
                    "slot {}: down, restarts {}, last exit: {}",
                    index,
                    slot.restarts,
                    slot.last_exit
                        .map_or_else(|| "none".to_string(), |exit| exit.to_string())
                ),
            };
            report.push_str(&line);
            report.push('\n');
        }
        report
    }

    fn spawn_slot(&mut self, slot: usize, now: Instant) -> Result<()> {
        match self.control.spawn(slot) {
            Ok(pid) => {
                log::info!("worker {} started with pid {}", slot, pid);
                let entry = &mut self.slots[slot];
                entry.pid = Some(pid);
                entry.started_at = Some(now);
                entry.respawn_at = None;
                Ok(())
            }
            Err(err) => {
                log::error!("could not start worker {}: {}; stopping", slot, err);
                self.slots[slot].respawn_at = None;
                self.failure = Some(err.clone());
                self.begin_stop(now);
                Err(err)
            }
        }
    }

    fn reap(&mut self, now: Instant) {
        for (pid, status) in self.control.reap() {
            let Some(index) = self.slots.iter().position(|s| s.pid == Some(pid)) else {
                log::debug!("reaped unknown child {}", pid);
                continue;
            };
            let exit = WorkerExit::from(status);
            let splay = self.splay();
            let stopping = self.state == MasterState::Stopping;
            let stable_after = self.config.stable_after;
            let max_failures = self.config.max_startup_failures;
            let slot = &mut self.slots[index];
            slot.pid = None;
            slot.last_exit = Some(exit);

            let ran = slot
                .started_at
                .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
            if ran >= stable_after {
                slot.startup_failures = 0;
            } else if exit.is_startup_failure() {
                slot.startup_failures += 1;
            }

            if stopping {
                log::info!("worker {} (pid {}) exited: {}", index, pid, exit);
            } else if slot.recycling {
                slot.recycling = false;
                slot.respawn_at = Some(now);
                log::info!("worker {} (pid {}) stopped for restart", index, pid);
            } else if exit.is_startup_failure()
                && slot.startup_failures >= max_failures
            {
                let failures = slot.startup_failures;
                log::error!(
                    "worker {} (pid {}) exited: {}; {} failed starts in a row, stopping",
                    index,
                    pid,
                    exit,
                    failures
                );
                self.failure = Some(Error::Spawn {
                    slot: index,
                    message: format!("{} after {} attempts", exit, failures),
                });
                self.begin_stop(now);
            } else if exit.should_restart() {
                slot.respawn_at = Some(now + splay);
                log::warn!(
                    "worker {} (pid {}) exited: {}; restarting in {:?}",
                    index,
                    pid,
                    exit,
                    splay
                );
            } else {
                log::info!("worker {} (pid {}) exited: {}; not restarting", index, pid, exit);
            }
        }
    }

    fn begin_stop(&mut self, now: Instant) {
        if self.state == MasterState::Stopping {
            return;
        }
        log::info!("stopping workers");
        self.state = MasterState::Stopping;
        self.stop_deadline = Some(now + self.config.stop_grace);
        for slot in &mut self.slots {
            slot.respawn_at = None;
            slot.recycling = false;
        }
        self.signal_all(Signal::Terminate);
    }

    fn restart_all(&mut self, now: Instant) {
        if self.state == MasterState::Stopping {
            return;
        }
        log::info!("restarting all workers");
        for index in 0..self.slots.len() {
            match self.slots[index].pid {
                Some(pid) => {
                    self.slots[index].recycling = true;
                    if let Err(err) = self.control.signal(pid, Signal::Terminate) {
                        log::warn!("could not stop worker {}: {}", index, err);
                    }
                }
                None => self.slots[index].respawn_at = Some(now),
            }
        }
    }

    fn signal_all(&mut self, signal: Signal) {
        for index in 0..self.slots.len() {
            if let Some(pid) = self.slots[index].pid {
                if let Err(err) = self.control.signal(pid, signal) {
                    log::warn!("could not signal worker {}: {}", index, err);
                }
            }
        }
    }

    fn splay(&self) -> Duration {
        let max = u64::try_from(self.config.max_splay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(0..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out pids from 100 and records every call.
    #[derive(Default)]
    struct FakeProcesses {
        next_pid: u32,
        spawned: Vec<(usize, u32)>,
        signals: Vec<(u32, Signal)>,
        exits: Vec<(u32, ExitStatusInfo)>,
        fail_slot: Option<usize>,
    }

    impl ProcessControl for FakeProcesses {
        fn spawn(&mut self, slot: usize) -> Result<u32> {
            if self.fail_slot == Some(slot) {
                return Err(Error::Spawn {
                    slot,
                    message: "fork: resource temporarily unavailable".into(),
                });
            }
            let pid = 100 + self.next_pid;
            self.next_pid += 1;
            self.spawned.push((slot, pid));
            Ok(pid)
        }

        fn signal(&mut self, pid: u32, signal: Signal) -> Result<()> {
            self.signals.push((pid, signal));
            Ok(())
        }

        fn reap(&mut self) -> Vec<(u32, ExitStatusInfo)> {
            std::mem::take(&mut self.exits)
        }
    }

    fn supervisor(workers: usize) -> Supervisor<FakeProcesses> {
        let config = SupervisorConfig {
            max_splay: Duration::ZERO,
            stop_grace: Duration::from_secs(30),
            ..SupervisorConfig::new(workers)
        };
        Supervisor::new(FakeProcesses::default(), config)
    }

    fn exit(sup: &mut Supervisor<FakeProcesses>, pid: u32, status: ExitStatusInfo) {
        sup.control.exits.push((pid, status));
    }

    #[test]
    fn test_start_spawns_every_slot() {
        let mut sup = supervisor(3);
        sup.start(Instant::now()).unwrap();
        assert_eq!(sup.control().spawned, vec![(0, 100), (1, 101), (2, 102)]);
        assert!(sup.slots().iter().all(|s| s.pid.is_some()));
        assert_eq!(sup.state(), MasterState::Running);
    }

    #[test]
    fn test_crashed_worker_is_respawned() {
        let mut sup = supervisor(2);
        let now = Instant::now();
        sup.start(now).unwrap();

        exit(&mut sup, 101, ExitStatusInfo::Signaled(libc::SIGSEGV));
        assert!(sup.poll_once(now));

        assert_eq!(sup.control().spawned.last(), Some(&(1, 102)));
        let slot = &sup.slots()[1];
        assert_eq!(slot.pid, Some(102));
        assert_eq!(slot.restarts, 1);
        assert_eq!(slot.last_exit, Some(WorkerExit::Unknown(128 + libc::SIGSEGV)));
    }

    #[test]
    fn test_respawn_waits_for_splay() {
        let config = SupervisorConfig {
            max_splay: Duration::from_secs(1),
            ..SupervisorConfig::new(1)
        };
        let mut sup = Supervisor::new(FakeProcesses::default(), config);
        let now = Instant::now();
        sup.start(now).unwrap();

        exit(&mut sup, 100, ExitStatusInfo::Exited(1));
        assert!(sup.poll_once(now));
        assert!(sup.slots()[0].pid.is_none() || sup.control().spawned.len() == 2);

        sup.poll_once(now + Duration::from_millis(1001));
        assert_eq!(sup.control().spawned.len(), 2);
        assert_eq!(sup.slots()[0].restarts, 1);
    }

    #[test]
    fn test_normal_exit_is_not_restarted() {
        let mut sup = supervisor(1);
        let now = Instant::now();
        sup.start(now).unwrap();

        exit(&mut sup, 100, ExitStatusInfo::Exited(EXIT_NORMAL));
        assert!(!sup.poll_once(now));
        assert_eq!(sup.control().spawned.len(), 1);
    }

    #[test]
    fn test_stop_terminates_then_escalates() {
        let mut sup = supervisor(2);
        let now = Instant::now();
        sup.start(now).unwrap();

        sup.handle_signal(SupervisorAction::Stop, now);
        assert_eq!(sup.state(), MasterState::Stopping);
        assert_eq!(
            sup.control().signals,
            vec![(100, Signal::Terminate), (101, Signal::Terminate)]
        );

        exit(&mut sup, 100, ExitStatusInfo::Exited(EXIT_MANUAL_KILL));
        assert!(sup.poll_once(now + Duration::from_secs(1)));
        assert_eq!(sup.control().spawned.len(), 2);

        assert!(sup.poll_once(now + Duration::from_secs(31)));
        assert_eq!(sup.control().signals.last(), Some(&(101, Signal::Kill)));

        exit(&mut sup, 101, ExitStatusInfo::Signaled(libc::SIGKILL));
        assert!(!sup.poll_once(now + Duration::from_secs(32)));
    }

    #[test]
    fn test_crash_while_stopping_is_not_restarted() {
        let mut sup = supervisor(1);
        let now = Instant::now();
        sup.start(now).unwrap();
        sup.handle_signal(SupervisorAction::Stop, now);

        exit(&mut sup, 100, ExitStatusInfo::Exited(1));
        assert!(!sup.poll_once(now));
        assert_eq!(sup.control().spawned.len(), 1);
    }

    #[test]
    fn test_hangup_recycles_every_worker() {
        let mut sup = supervisor(2);
        let now = Instant::now();
        sup.start(now).unwrap();

        sup.handle_signal(SupervisorAction::Restart, now);
        assert_eq!(
            sup.control().signals,
            vec![(100, Signal::Terminate), (101, Signal::Terminate)]
        );

        exit(&mut sup, 100, ExitStatusInfo::Exited(EXIT_MANUAL_KILL));
        exit(&mut sup, 101, ExitStatusInfo::Signaled(libc::SIGTERM));
        assert!(sup.poll_once(now));

        assert_eq!(
            sup.control().spawned,
            vec![(0, 100), (1, 101), (0, 102), (1, 103)]
        );
        assert_eq!(sup.state(), MasterState::Running);
    }

    #[test]
    fn test_reload_is_forwarded() {
        let mut sup = supervisor(2);
        sup.start(Instant::now()).unwrap();
        sup.handle_signal(SupervisorAction::Reload, Instant::now());
        assert_eq!(
            sup.control().signals,
            vec![(100, Signal::Reload), (101, Signal::Reload)]
        );
    }

    #[test]
    fn test_spawn_failure_stops_everything() {
        let mut sup = supervisor(3);
        sup.control.fail_slot = Some(1);
        let now = Instant::now();

        let err = sup.start(now).unwrap_err();
        assert!(matches!(err, Error::Spawn { slot: 1, .. }));
        assert!(sup.is_degraded());
        assert_eq!(sup.state(), MasterState::Stopping);
        assert_eq!(sup.control().signals, vec![(100, Signal::Terminate)]);

        exit(&mut sup, 100, ExitStatusInfo::Exited(EXIT_MANUAL_KILL));
        assert!(!sup.poll_once(now));
    }

    #[test]
    fn test_worker_that_never_starts_stops_the_master() {
        let mut sup = supervisor(2);
        let now = Instant::now();
        sup.start(now).unwrap();

        // Slot 0 exits with a connect error right after every spawn.
        let mut pid = 100;
        for attempt in 1..=5 {
            exit(&mut sup, pid, ExitStatusInfo::Exited(EXIT_CONNECT_ERROR));
            sup.poll_once(now);
            assert_eq!(sup.slots()[0].startup_failures, attempt);
            if attempt < 5 {
                pid = sup.slots()[0].pid.unwrap();
                assert_eq!(sup.state(), MasterState::Running);
            }
        }

        assert_eq!(sup.state(), MasterState::Stopping);
        assert!(sup.is_degraded());
        assert_eq!(sup.control().spawned.len(), 2 + 4);
        assert_eq!(sup.control().signals, vec![(101, Signal::Terminate)]);

        exit(&mut sup, 101, ExitStatusInfo::Exited(EXIT_MANUAL_KILL));
        assert!(!sup.poll_once(now));
        assert!(matches!(sup.failure, Some(Error::Spawn { slot: 0, .. })));
    }

    #[test]
    fn test_stable_run_clears_startup_failures() {
        let mut sup = supervisor(1);
        let now = Instant::now();
        sup.start(now).unwrap();

        for pid in 100..104 {
            exit(&mut sup, pid, ExitStatusInfo::Exited(EXIT_FORK_FAILED));
            sup.poll_once(now);
        }
        assert_eq!(sup.slots()[0].startup_failures, 4);

        let later = now + Duration::from_secs(10);
        exit(&mut sup, 104, ExitStatusInfo::Exited(EXIT_FORK_FAILED));
        assert!(sup.poll_once(later));
        assert_eq!(sup.slots()[0].startup_failures, 0);
        assert_eq!(sup.state(), MasterState::Running);
        assert_eq!(sup.slots()[0].pid, Some(105));
    }

    #[test]
    fn test_repeated_crashes_keep_restarting() {
        let mut sup = supervisor(1);
        let now = Instant::now();
        sup.start(now).unwrap();

        for pid in 100..120 {
            exit(&mut sup, pid, ExitStatusInfo::Signaled(libc::SIGSEGV));
            assert!(sup.poll_once(now));
        }
        assert_eq!(sup.state(), MasterState::Running);
        assert_eq!(sup.slots()[0].restarts, 20);
        assert_eq!(sup.slots()[0].startup_failures, 0);
    }

    #[test]
    fn test_status_report_lists_slots() {
        let mut sup = supervisor(2);
        let now = Instant::now();
        sup.start(now).unwrap();
        exit(&mut sup, 101, ExitStatusInfo::Exited(EXIT_NORMAL));
        sup.poll_once(now);

        let report = sup.status_report(now + Duration::from_secs(5));
        assert!(report.contains("slot 0: pid 100, up 5s, restarts 0"));
        assert!(report.contains("slot 1: down, restarts 0, last exit: normal exit"));
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(
            SupervisorAction::from_signal(libc::SIGINT),
            Some(SupervisorAction::Stop)
        );
        assert_eq!(
            SupervisorAction::from_signal(libc::SIGHUP),
            Some(SupervisorAction::Restart)
        );
        assert_eq!(
            SupervisorAction::from_signal(libc::SIGUSR2),
            Some(SupervisorAction::Status)
        );
        assert_eq!(SupervisorAction::from_signal(libc::SIGPIPE), None);
        assert_eq!(Signal::Reload.as_raw(), libc::SIGUSR1);
    }
}
