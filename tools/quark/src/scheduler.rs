//! Compilation scheduler.
//!
//! Runs compile tasks across the host pool with a single event loop. Each
//! job is one external process (a local `sh -c` or a remote shell); reader
//! threads forward its output over one channel, and the loop waits on that
//! channel for the set of jobs that have something new. A job is finished
//! once both of its streams have closed. Failed jobs are classified, hosts
//! that look unreachable are evicted, and transient failures are retried up
//! to the configured bound.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Read;
use std::process::{Child, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::classify::{FailureClassifier, JobOutput, Outcome};
use crate::command;
use crate::compile::CompileTask;
use crate::config::RemoteConfig;
use crate::hosts::{Host, HostPool, HostSlot};
use crate::unit::UnitId;
use crate::verbose::{self, Progress, vprintln, wprintln};

/// Errors that end the whole scheduling run.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("all hosts have been evicted with {remaining} compilation(s) still to run")]
    HostsExhausted { remaining: usize },
}

/// Final state of a unit after scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Succeeded,
    FailedPermanent,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub status: FinalStatus,
    /// Attempts made, starting at 1.
    pub attempts: u32,
    /// Host of the last attempt.
    pub host: Option<Host>,
    /// Captured output of the last attempt.
    pub output: String,
}

/// Starts the process for one attempt of a task on a slot.
///
/// The child must have piped stdout and stderr.
pub trait Launcher {
    fn launch(&self, task: &CompileTask, slot: &HostSlot, attempt: u32) -> std::io::Result<Child>;
}

/// Runs the wrapped compile command with `sh -c` or the configured remote shell.
pub struct ShellLauncher<'c> {
    remote: &'c RemoteConfig,
}

impl<'c> ShellLauncher<'c> {
    pub fn new(remote: &'c RemoteConfig) -> Self {
        Self { remote }
    }
}

impl Launcher for ShellLauncher<'_> {
    fn launch(&self, task: &CompileTask, slot: &HostSlot, _attempt: u32) -> std::io::Result<Child> {
        let script = command::job_script(&task.dir, &task.command_line);
        vprintln!("  {script}");
        command::host_command(slot, &self.remote.shell, &self.remote.flags, &script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Attempts allowed for a unit whose failures are all transient.
    pub max_retries: u32,
    /// Quiet interval after which the loop reports what it is waiting for.
    pub still_waiting: Duration,
}

impl SchedulerOptions {
    pub fn from_config(remote: &RemoteConfig) -> Self {
        Self {
            max_retries: remote.max_retries,
            still_waiting: remote.still_waiting,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Message from a reader thread.
enum Event {
    Chunk { job: usize, stream: Stream, data: Vec<u8> },
    Closed { job: usize },
}

struct RunningJob {
    task: usize,
    slot: HostSlot,
    attempt: u32,
    child: Child,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    open_streams: u8,
}

pub struct Scheduler<L, C> {
    launcher: L,
    classifier: C,
    options: SchedulerOptions,
}

impl<L: Launcher, C: FailureClassifier> Scheduler<L, C> {
    pub fn new(launcher: L, classifier: C, options: SchedulerOptions) -> Self {
        Self {
            launcher,
            classifier,
            options,
        }
    }

    /// Compile every task, returning the final report of each unit.
    pub fn run(
        &self,
        tasks: &[CompileTask],
        hosts: &mut HostPool,
    ) -> Result<BTreeMap<UnitId, JobReport>, SchedulerError> {
        let (tx, rx) = mpsc::channel();
        let mut pending: VecDeque<(usize, u32)> = (0..tasks.len()).map(|i| (i, 1)).collect();
        let mut running: HashMap<usize, RunningJob> = HashMap::new();
        let mut busy: HashMap<Host, usize> = HashMap::new();
        let mut reports = BTreeMap::new();
        let mut next_job = 0usize;

        loop {
            while let Some(slot) = pick_slot(hosts, &busy, pending.len() + running.len()) {
                let Some((idx, attempt)) = pending.pop_front() else {
                    break;
                };
                let task = &tasks[idx];
                match self.start(task, &slot, attempt, next_job, &tx) {
                    Ok(child) => {
                        verbose::progress(Progress::Launched {
                            unit: &task.label,
                            host: &slot.host,
                        });
                        *busy.entry(slot.host.clone()).or_default() += 1;
                        running.insert(
                            next_job,
                            RunningJob {
                                task: idx,
                                slot,
                                attempt,
                                child,
                                stdout: Vec::new(),
                                stderr: Vec::new(),
                                open_streams: 2,
                            },
                        );
                        next_job += 1;
                    }
                    Err(e) => {
                        reports.insert(
                            task.unit,
                            JobReport {
                                status: FinalStatus::FailedPermanent,
                                attempts: attempt,
                                host: Some(slot.host),
                                output: format!("failed to start compile job: {e}"),
                            },
                        );
                    }
                }
            }

            if running.is_empty() {
                if pending.is_empty() {
                    break;
                }
                return Err(SchedulerError::HostsExhausted {
                    remaining: pending.len(),
                });
            }

            let ready = wait_ready(&rx, &mut running, self.options.still_waiting);
            if ready.is_empty() {
                let waiting: Vec<String> = running
                    .values()
                    .map(|job| format!("{} on {}", tasks[job.task].label, job.slot.host))
                    .collect();
                verbose::progress(Progress::StillWaiting(&waiting));
                continue;
            }

            for job_id in ready {
                if running.get(&job_id).is_none_or(|job| job.open_streams > 0) {
                    continue;
                }
                let Some(mut job) = running.remove(&job_id) else {
                    continue;
                };
                if let Some(count) = busy.get_mut(&job.slot.host) {
                    *count = count.saturating_sub(1);
                }
                let _ = job.child.wait();

                let task = &tasks[job.task];
                let output = JobOutput::from_streams(&job.stdout, &job.stderr);
                verbose::progress(Progress::Finished {
                    unit: &task.label,
                    host: &job.slot.host,
                });

                let outcome = self.classifier.classify(&output);
                if let Outcome::FailedRetryable { evict_host: true } = outcome {
                    if hosts.evict(&job.slot.host) > 0 {
                        verbose::progress(Progress::Evicted { host: &job.slot.host });
                        if hosts.is_empty() {
                            wprintln!("no compile hosts left after evicting {}", job.slot.host);
                        }
                    }
                }
                let status = match outcome {
                    Outcome::Succeeded => FinalStatus::Succeeded,
                    Outcome::FailedRetryable { .. } if job.attempt < self.options.max_retries => {
                        verbose::progress(Progress::Retrying {
                            unit: &task.label,
                            attempt: job.attempt + 1,
                        });
                        pending.push_back((job.task, job.attempt + 1));
                        continue;
                    }
                    Outcome::FailedRetryable { .. } | Outcome::FailedPermanent => {
                        FinalStatus::FailedPermanent
                    }
                };
                reports.insert(
                    task.unit,
                    JobReport {
                        status,
                        attempts: job.attempt,
                        host: Some(job.slot.host),
                        output: output.combined(),
                    },
                );
            }
        }

        Ok(reports)
    }

    /// Remove the stale object, then launch and attach reader threads.
    fn start(
        &self,
        task: &CompileTask,
        slot: &HostSlot,
        attempt: u32,
        job: usize,
        tx: &Sender<Event>,
    ) -> std::io::Result<Child> {
        match std::fs::remove_file(&task.object) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        if let Some(parent) = task.object.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut child = self.launcher.launch(task, slot, attempt)?;
        match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => {
                spawn_reader(out, job, Stream::Stdout, tx.clone());
                spawn_reader(err, job, Stream::Stderr, tx.clone());
                Ok(child)
            }
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                Err(std::io::Error::other("compile job has no piped output"))
            }
        }
    }
}

/// Forward everything read from `pipe` as chunks, then a close event.
fn spawn_reader<R: Read + Send + 'static>(mut pipe: R, job: usize, stream: Stream, tx: Sender<Event>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let data = buf[..n].to_vec();
                    if tx.send(Event::Chunk { job, stream, data }).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(Event::Closed { job });
    });
}

/// Block until at least one job has new output or a closed stream, then
/// drain whatever else is already queued. Returns the jobs touched, in the
/// order they first became ready; empty if `quiet` passed without events.
fn wait_ready(rx: &Receiver<Event>, running: &mut HashMap<usize, RunningJob>, quiet: Duration) -> Vec<usize> {
    let first = match rx.recv_timeout(quiet) {
        Ok(event) => event,
        Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return Vec::new(),
    };
    let mut ready = Vec::new();
    let mut apply = |event: Event| {
        let job_id = match event {
            Event::Chunk { job, stream, data } => {
                if let Some(state) = running.get_mut(&job) {
                    match stream {
                        Stream::Stdout => state.stdout.extend_from_slice(&data),
                        Stream::Stderr => state.stderr.extend_from_slice(&data),
                    }
                }
                job
            }
            Event::Closed { job } => {
                if let Some(state) = running.get_mut(&job) {
                    state.open_streams = state.open_streams.saturating_sub(1);
                }
                job
            }
        };
        if !ready.contains(&job_id) {
            ready.push(job_id);
        }
    };
    apply(first);
    while let Ok(event) = rx.try_recv() {
        apply(event);
    }
    ready
}

/// First free slot in pool order, preferring a local slot when only one
/// unit is left to compile.
fn pick_slot(hosts: &HostPool, busy: &HashMap<Host, usize>, remaining: usize) -> Option<HostSlot> {
    let mut seen: HashMap<&Host, usize> = HashMap::new();
    let mut free = Vec::new();
    for slot in hosts.slots() {
        let nth = seen.entry(&slot.host).or_default();
        if *nth >= busy.get(&slot.host).copied().unwrap_or(0) {
            free.push(slot);
        }
        *nth += 1;
    }
    let chosen = if remaining == 1 {
        free.iter().find(|s| s.host.is_local()).or(free.first())
    } else {
        free.first()
    };
    chosen.map(|s| (*s).clone())
}

/// Whether an executable can be linked: every unit of its link set either
/// compiled successfully or was not scheduled at all.
pub fn link_eligible(link_set: &[UnitId], reports: &BTreeMap<UnitId, JobReport>) -> bool {
    link_set
        .iter()
        .all(|id| reports.get(id).is_none_or(|r| r.status == FinalStatus::Succeeded))
}
