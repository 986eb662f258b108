//! Execution engine - runs a plan with idempotence checks and failure policies
//!
//! For every step, in plan order:
//! 1. A step recorded as done for its current fingerprint is probed; if the
//!    probe confirms, the step is skipped.
//! 2. Otherwise it is applied (dry runs only record the decision).
//! 3. A failed apply is handled by the step's failure policy.
//! 4. The settled result is persisted before the next step starts.
//!
//! The executor itself never touches the host: all side effects happen in
//! [`Step::apply`](crate::Step::apply).

use chrono::Utc;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::context::{ApplyContext, CancelToken, ProgressCallback};
use crate::error::{ApplyError, Error, Result};
use crate::fingerprint::Fingerprint;
use crate::planner::ExecutionPlan;
use crate::retry::{Backoff, sleep_unless_cancelled};
use crate::state::{StateStore, StepRecord};
use crate::step::SharedStep;
use crate::types::{
    ErrorKind, ExecuteOptions, FailurePolicy, ProbeOutcome, RunMode, RunReport, RunState,
    StepError, StepResult, StepStatus,
};

/// Execute a plan against a state store
///
/// # Arguments
/// * `plan` - The execution plan to run
/// * `store` - State record; written after every settled step in apply mode
/// * `opts` - Mode, default timeout, parallelism and cancellation
/// * `progress` - Progress callback
///
/// # Returns
/// The run report. Step failures are part of the report; an `Err` means the
/// state record could not be written, which stops the run.
pub fn execute<P>(
    plan: &ExecutionPlan,
    store: &mut StateStore,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> Result<RunReport>
where
    P: ProgressCallback + ?Sized,
{
    if opts.mode == RunMode::Apply && store.path().is_some() && !store.is_locked() {
        return Err(Error::State {
            path: store.path().map(|p| p.to_path_buf()).unwrap_or_default(),
            message: "apply requires a locked state store".to_string(),
        });
    }

    progress.on_run_start(plan.len(), opts.mode);

    let report = if opts.jobs > 1 {
        execute_waves(plan, store, opts, progress)?
    } else {
        execute_sequential(plan, store, opts, progress)?
    };

    log::info!(
        "Run {}: {} succeeded, {} skipped, {} failed, {} not started",
        report.state,
        report.succeeded(),
        report.skipped(),
        report.failed(),
        report.not_started.len()
    );

    progress.on_run_complete(&report);
    Ok(report)
}

/// Bookkeeping shared by the sequential and wave runners
#[derive(Default)]
struct RunLog {
    results: Vec<StepResult>,
    failed: HashSet<String>,
    stop: Option<RunState>,
    /// Apply workers still running past their timeout
    stragglers: Vec<(String, JoinHandle<()>)>,
}

impl RunLog {
    fn settle(&mut self, outcome: StepOutcome) {
        if let Some(handle) = outcome.straggler {
            self.stragglers.push((outcome.result.name.clone(), handle));
        }
        let result = &outcome.result;
        if result.is_failed() {
            self.failed.insert(result.name.clone());
            if self.stop.is_none() {
                if matches!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::Cancelled)) {
                    self.stop = Some(RunState::Cancelled);
                } else if outcome.aborts {
                    self.stop = Some(RunState::Aborted {
                        step: result.name.clone(),
                    });
                }
            }
        }
        self.results.push(outcome.result);
    }

    /// Build the report once every apply worker has finished
    ///
    /// The caller holds the state lock until this returns, so a timed-out
    /// step never keeps changing the host after the lock is released.
    fn into_report(self, mode: RunMode, not_started: Vec<String>) -> RunReport {
        for (name, handle) in self.stragglers {
            log::warn!("Waiting for timed-out step '{}' to finish", name);
            if handle.join().is_err() {
                log::warn!("Timed-out step '{}' panicked", name);
            }
        }
        let state = match self.stop {
            Some(state) => state,
            None if self.failed.is_empty() => RunState::Completed,
            None => RunState::Partial,
        };
        RunReport {
            mode,
            state,
            results: self.results,
            not_started,
        }
    }
}

fn execute_sequential<P>(
    plan: &ExecutionPlan,
    store: &mut StateStore,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> Result<RunReport>
where
    P: ProgressCallback + ?Sized,
{
    let steps = plan.steps();
    let mut log = RunLog::default();

    for (i, step) in steps.iter().enumerate() {
        if opts.cancel.is_cancelled() {
            log::warn!("Run cancelled before '{}'", step.name());
            log.stop = Some(RunState::Cancelled);
        }
        if log.stop.is_some() {
            return Ok(log.into_report(opts.mode, names(&steps[i..])));
        }

        progress.on_step_start(step.name(), &step.description());
        let prior = store.record().get(step.name()).cloned();
        let outcome = run_step(
            step,
            prior.as_ref(),
            &log.failed,
            opts,
            &mut |attempt, max, err, delay| progress.on_retry(step.name(), attempt, max, err, delay),
        );

        if opts.mode == RunMode::Apply
            && let Some(fingerprint) = &outcome.persist
        {
            store.commit(&outcome.result, fingerprint)?;
        }

        progress.on_step_complete(&outcome.result);
        log.settle(outcome);
    }

    Ok(log.into_report(opts.mode, Vec::new()))
}

/// Run each wave of the plan on a thread pool
///
/// A wave starts only after every step of the previous wave settled, so no
/// step starts before its dependencies. Progress for a wave is reported after
/// it finishes, since the callback is not shared across threads.
fn execute_waves<P>(
    plan: &ExecutionPlan,
    store: &mut StateStore,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> Result<RunReport>
where
    P: ProgressCallback + ?Sized,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.jobs)
        .build()
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    let waves = plan.waves();
    let mut log = RunLog::default();

    for (w, wave) in waves.iter().enumerate() {
        if opts.cancel.is_cancelled() {
            log::warn!("Run cancelled before wave {}", w + 1);
            log.stop = Some(RunState::Cancelled);
        }
        if log.stop.is_some() {
            let rest = waves[w..].iter().flat_map(|wave| names(wave)).collect();
            return Ok(log.into_report(opts.mode, rest));
        }

        log::debug!("Wave {}/{}: {}", w + 1, waves.len(), names(wave).join(", "));
        for step in wave {
            progress.on_step_start(step.name(), &step.description());
        }

        let priors: Vec<Option<StepRecord>> = wave
            .iter()
            .map(|s| store.record().get(s.name()).cloned())
            .collect();
        let failed = &log.failed;
        let shared = Mutex::new(&mut *store);

        let outcomes: Vec<Result<StepOutcome>> = pool.install(|| {
            wave.par_iter()
                .zip(priors.par_iter())
                .map(|(step, prior)| {
                    let outcome = run_step(
                        step,
                        prior.as_ref(),
                        failed,
                        opts,
                        &mut |attempt, max, err, delay| {
                            log::warn!(
                                "'{}' attempt {}/{} failed: {}; retrying in {:?}",
                                step.name(),
                                attempt,
                                max,
                                err,
                                delay
                            );
                        },
                    );
                    if opts.mode == RunMode::Apply
                        && let Some(fingerprint) = &outcome.persist
                    {
                        let mut store = shared.lock().unwrap_or_else(|e| e.into_inner());
                        store.commit(&outcome.result, fingerprint)?;
                    }
                    Ok(outcome)
                })
                .collect()
        });

        for outcome in outcomes {
            let outcome = outcome?;
            progress.on_step_complete(&outcome.result);
            log.settle(outcome);
        }
    }

    Ok(log.into_report(opts.mode, Vec::new()))
}

fn names(steps: &[SharedStep]) -> Vec<String> {
    steps.iter().map(|s| s.name().to_string()).collect()
}

// ============================================================================
// Single step
// ============================================================================

/// Settled result of one step plus what the runner must do with it
struct StepOutcome {
    result: StepResult,
    /// Fingerprint to persist the result under; `None` leaves the record alone
    persist: Option<Fingerprint>,
    /// Whether this failure stops the run
    aborts: bool,
    /// Worker of a timed-out attempt that has not returned yet
    straggler: Option<JoinHandle<()>>,
}

impl StepOutcome {
    fn new(result: StepResult) -> Self {
        Self {
            result,
            persist: None,
            aborts: false,
            straggler: None,
        }
    }
}

/// How one apply invocation ended
enum Attempt {
    Done,
    Failed(StepError),
    /// The deadline passed; the worker may still be running
    TimedOut(StepError, JoinHandle<()>),
}

fn run_step(
    step: &SharedStep,
    prior: Option<&StepRecord>,
    failed: &HashSet<String>,
    opts: &ExecuteOptions,
    on_retry: &mut dyn FnMut(u32, u32, &StepError, Duration),
) -> StepOutcome {
    let name = step.name();
    let clock = Instant::now();
    let started_at = Utc::now();
    let settle = |status: StepStatus, error: Option<StepError>, attempts: u32| {
        let mut result = StepResult::new(name, status, started_at);
        result.error = error;
        result.attempts = attempts;
        result.duration = clock.elapsed();
        result
    };

    if let Some(dep) = step.header().depends_on.iter().find(|d| failed.contains(*d)) {
        log::warn!("Not running '{}': hard dependency '{}' failed", name, dep);
        let error = StepError::new(
            ErrorKind::DependencyFailed,
            format!("hard dependency '{}' failed", dep),
        );
        return StepOutcome::new(settle(StepStatus::Failed, Some(error), 0));
    }

    let fingerprint = match step.fingerprint() {
        Ok(fp) => fp,
        Err(e) => {
            let error = StepError::new(ErrorKind::Input, format!("{:#}", e));
            log::error!("Cannot fingerprint '{}': {}", name, error.message);
            return StepOutcome {
                aborts: step.failure_policy().aborts(),
                ..StepOutcome::new(settle(StepStatus::Failed, Some(error), 0))
            };
        }
    };

    match prior {
        Some(record) if record.is_done_for(&fingerprint) => match probe_step(step) {
            ProbeOutcome::Satisfied => {
                log::debug!("'{}' already done ({})", name, fingerprint.short());
                return StepOutcome {
                    persist: Some(fingerprint),
                    ..StepOutcome::new(settle(StepStatus::Skipped, None, 0))
                };
            }
            outcome => log::info!(
                "'{}' is recorded as done but its probe reports {}; applying again",
                name,
                outcome
            ),
        },
        Some(record) if record.status.is_settled_ok() => {
            log::info!("Inputs of '{}' changed since it last succeeded", name);
        }
        _ => {}
    }

    if opts.mode == RunMode::DryRun {
        return StepOutcome::new(settle(StepStatus::WouldRun, None, 0));
    }

    let policy = step.failure_policy();
    let max_attempts = policy.max_attempts();
    let backoff = match policy {
        FailurePolicy::RetryThenAbort { backoff, .. } => Backoff::new(backoff),
        _ => Backoff::new(Duration::ZERO),
    };
    let timeout = step.timeout().unwrap_or(opts.default_timeout);

    let mut attempt = 0;
    let mut straggler = None;
    let error = loop {
        attempt += 1;
        let err = match attempt_apply(step, attempt, timeout, &opts.cancel) {
            Attempt::Done => break None,
            Attempt::Failed(err) => err,
            Attempt::TimedOut(err, handle) if handle.is_finished() => {
                let _ = handle.join();
                err
            }
            Attempt::TimedOut(err, handle) => {
                // Another attempt would race the one still running
                log::warn!("'{}' is still running after its timeout; not retrying", name);
                straggler = Some(handle);
                break Some(err);
            }
        };
        log::warn!("'{}' attempt {}/{} failed: {}", name, attempt, max_attempts, err);

        if attempt >= max_attempts {
            break Some(err);
        }
        let delay = backoff.delay_after(attempt);
        on_retry(attempt, max_attempts, &err, delay);
        if !sleep_unless_cancelled(delay, &opts.cancel) {
            break Some(StepError::from(Error::Cancelled {
                step: name.to_string(),
            }));
        }
    };

    match error {
        None => {
            log::info!("'{}' succeeded after {} attempt(s)", name, attempt);
            StepOutcome {
                persist: Some(fingerprint),
                ..StepOutcome::new(settle(StepStatus::Succeeded, None, attempt))
            }
        }
        Some(error) => {
            log::error!("'{}' failed ({}): {}", name, policy, error);
            StepOutcome {
                persist: Some(fingerprint),
                aborts: policy.aborts(),
                result: settle(StepStatus::Failed, Some(error), attempt),
                straggler,
            }
        }
    }
}

/// Run the probe, turning probe errors into `Unknown`
fn probe_step(step: &SharedStep) -> ProbeOutcome {
    match step.probe() {
        Ok(outcome) => outcome,
        Err(e) => {
            let err = Error::Probe {
                step: step.name().to_string(),
                message: format!("{:#}", e),
            };
            log::warn!("{}; treating as unsatisfied", err);
            ProbeOutcome::Unknown
        }
    }
}

/// One apply invocation bounded by the step timeout, followed by a probe
///
/// The apply function runs on its own thread. On timeout the thread is
/// handed back to the caller, which must not start another attempt while it
/// runs; the context's deadline lets well-behaved apply functions stop their
/// external commands at the same moment.
fn attempt_apply(step: &SharedStep, attempt: u32, timeout: Duration, cancel: &CancelToken) -> Attempt {
    let ctx = ApplyContext {
        step: step.name().to_string(),
        attempt,
        deadline: Instant::now() + timeout,
        cancel: cancel.clone(),
    };

    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(step);
    let spawned = thread::Builder::new()
        .name(format!("apply-{}", step.name()))
        .spawn(move || {
            let _ = tx.send(worker.apply(&ctx));
        });
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            return Attempt::Failed(StepError::new(
                ErrorKind::Apply,
                format!("failed to start worker: {}", e),
            ));
        }
    };

    let failure = match rx.recv_timeout(timeout) {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(StepError::from(Error::Apply {
            step: step.name().to_string(),
            message: format!("{:#}", e),
            exit_code: ApplyError::find(&e).and_then(|a| a.exit_code),
        })),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            let err = Error::Timeout {
                step: step.name().to_string(),
                after: timeout,
            };
            return Attempt::TimedOut(StepError::from(err), handle);
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Some(StepError::new(ErrorKind::Apply, "apply panicked"))
        }
    };
    let _ = handle.join();
    if let Some(error) = failure {
        return Attempt::Failed(error);
    }

    match probe_step(step) {
        ProbeOutcome::Unsatisfied => Attempt::Failed(StepError::new(
            ErrorKind::Verification,
            "apply finished but the postcondition does not hold",
        )),
        _ => Attempt::Done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::planner::plan;
    use crate::step::{Step, StepHeader};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Simulated host: the set of step names whose effect is in place
    #[derive(Debug, Default)]
    struct FakeHost {
        applied: Mutex<HashSet<String>>,
        calls: Mutex<Vec<String>>,
        running: AtomicU32,
        peak_running: AtomicU32,
    }

    impl FakeHost {
        fn has(&self, name: &str) -> bool {
            self.applied.lock().unwrap().contains(name)
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn drift(&self, name: &str) {
            self.applied.lock().unwrap().remove(name);
        }
    }

    #[derive(Debug)]
    enum Behavior {
        Succeed,
        AlwaysFail,
        FailTimes(AtomicU32),
        Sleep(Duration),
        CancelRun(CancelToken),
        NoEffect,
        ExitCode(i32),
    }

    #[derive(Debug)]
    struct TestStep {
        header: StepHeader,
        input: String,
        host: Arc<FakeHost>,
        behavior: Behavior,
    }

    impl Step for TestStep {
        fn header(&self) -> &StepHeader {
            &self.header
        }

        fn kind(&self) -> &'static str {
            "test"
        }

        fn fingerprint(&self) -> anyhow::Result<Fingerprint> {
            Ok(Fingerprint::builder("test").field("input", &self.input).finish())
        }

        fn probe(&self) -> anyhow::Result<ProbeOutcome> {
            Ok(ProbeOutcome::from_bool(self.host.has(self.name())))
        }

        fn apply(&self, _ctx: &ApplyContext) -> anyhow::Result<()> {
            self.host.calls.lock().unwrap().push(self.name().to_string());
            match &self.behavior {
                Behavior::Succeed => {}
                Behavior::AlwaysFail => anyhow::bail!("boom"),
                Behavior::FailTimes(left) => {
                    if left.load(Ordering::SeqCst) > 0 {
                        left.fetch_sub(1, Ordering::SeqCst);
                        anyhow::bail!("transient");
                    }
                }
                Behavior::Sleep(d) => {
                    let now = self.host.running.fetch_add(1, Ordering::SeqCst) + 1;
                    self.host.peak_running.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(*d);
                    self.host.running.fetch_sub(1, Ordering::SeqCst);
                }
                Behavior::CancelRun(token) => token.cancel(),
                Behavior::NoEffect => return Ok(()),
                Behavior::ExitCode(code) => {
                    return Err(ApplyError::new("tool failed", Some(*code)).into());
                }
            }
            self.host.applied.lock().unwrap().insert(self.name().to_string());
            Ok(())
        }
    }

    fn step(host: &Arc<FakeHost>, header: StepHeader, behavior: Behavior) -> SharedStep {
        Arc::new(TestStep {
            header,
            input: "v1".to_string(),
            host: Arc::clone(host),
            behavior,
        })
    }

    fn ok(host: &Arc<FakeHost>, name: &str, deps: &[&str]) -> SharedStep {
        step(host, StepHeader::new(name).depends_on(deps), Behavior::Succeed)
    }

    fn run(plan: &ExecutionPlan, store: &mut StateStore, opts: &ExecuteOptions) -> RunReport {
        execute(plan, store, opts, &mut NoProgress).unwrap()
    }

    fn statuses(report: &RunReport) -> Vec<(String, StepStatus)> {
        report.results.iter().map(|r| (r.name.clone(), r.status)).collect()
    }

    #[test]
    fn test_fan_out_then_all_skipped() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::default());
        let steps = vec![ok(&host, "a", &[]), ok(&host, "b", &["a"]), ok(&host, "c", &["a"])];
        let plan = plan(steps).unwrap();

        let mut store = StateStore::open_locked(dir.path()).unwrap();
        let first = run(&plan, &mut store, &ExecuteOptions::default());
        assert_eq!(first.state, RunState::Completed);
        assert_eq!(
            statuses(&first),
            vec![
                ("a".to_string(), StepStatus::Succeeded),
                ("b".to_string(), StepStatus::Succeeded),
                ("c".to_string(), StepStatus::Succeeded),
            ]
        );

        let second = run(&plan, &mut store, &ExecuteOptions::default());
        assert_eq!(second.state, RunState::Completed);
        assert_eq!(second.skipped(), 3);
        assert_eq!(host.calls(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_idempotent_across_store_reopen() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![ok(&host, "a", &[]), ok(&host, "b", &["a"])]).unwrap();

        {
            let mut store = StateStore::open_locked(dir.path()).unwrap();
            run(&plan, &mut store, &ExecuteOptions::default());
        }
        let mut store = StateStore::open_locked(dir.path()).unwrap();
        let report = run(&plan, &mut store, &ExecuteOptions::default());
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.failed(), 0);
    }

    #[test]
    fn test_cycle_means_no_apply() {
        let host = Arc::new(FakeHost::default());
        let result = plan(vec![ok(&host, "a", &["b"]), ok(&host, "b", &["a"])]);
        assert!(matches!(result, Err(Error::CyclicDependency { .. })));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_retry_then_abort() {
        let host = Arc::new(FakeHost::default());
        let policy = FailurePolicy::RetryThenAbort {
            max: 3,
            backoff: Duration::from_millis(1),
        };
        let plan = plan(vec![
            step(&host, StepHeader::new("d").policy(policy), Behavior::AlwaysFail),
            ok(&host, "e", &[]),
        ])
        .unwrap();

        let mut store = StateStore::in_memory();
        let report = run(&plan, &mut store, &ExecuteOptions::default());

        let d = report.result("d").unwrap();
        assert_eq!(d.status, StepStatus::Failed);
        assert_eq!(d.attempts, 3);
        assert_eq!(report.state, RunState::Aborted { step: "d".to_string() });
        assert_eq!(report.not_started, vec!["e"]);
        assert_eq!(host.calls(), vec!["d", "d", "d"]);
    }

    #[test]
    fn test_retry_recovers() {
        let host = Arc::new(FakeHost::default());
        let policy = FailurePolicy::RetryThenAbort {
            max: 3,
            backoff: Duration::from_millis(1),
        };
        let plan = plan(vec![step(
            &host,
            StepHeader::new("flaky").policy(policy),
            Behavior::FailTimes(AtomicU32::new(2)),
        )])
        .unwrap();

        let report = run(&plan, &mut StateStore::in_memory(), &ExecuteOptions::default());
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.result("flaky").unwrap().attempts, 3);
    }

    #[test]
    fn test_abort_stops_run_and_resume() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::default());
        let broken = plan(vec![
            ok(&host, "one", &[]),
            ok(&host, "two", &["one"]),
            step(&host, StepHeader::new("three").depends_on(&["two"]), Behavior::AlwaysFail),
            ok(&host, "four", &["three"]),
        ])
        .unwrap();

        {
            let mut store = StateStore::open_locked(dir.path()).unwrap();
            let report = run(&broken, &mut store, &ExecuteOptions::default());
            assert!(report.state.is_aborted());
            assert_eq!(report.not_started, vec!["four"]);
        }

        // Fixed manifest: same inputs, working apply
        let fixed = plan(vec![
            ok(&host, "one", &[]),
            ok(&host, "two", &["one"]),
            ok(&host, "three", &["two"]),
            ok(&host, "four", &["three"]),
        ])
        .unwrap();
        let mut store = StateStore::open_locked(dir.path()).unwrap();
        let report = run(&fixed, &mut store, &ExecuteOptions::default());
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(
            statuses(&report),
            vec![
                ("one".to_string(), StepStatus::Skipped),
                ("two".to_string(), StepStatus::Skipped),
                ("three".to_string(), StepStatus::Succeeded),
                ("four".to_string(), StepStatus::Succeeded),
            ]
        );
    }

    #[test]
    fn test_fingerprint_change_reruns() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::default());
        let mut store = StateStore::open_locked(dir.path()).unwrap();

        let v1 = plan(vec![ok(&host, "config", &[])]).unwrap();
        run(&v1, &mut store, &ExecuteOptions::default());

        let changed: SharedStep = Arc::new(TestStep {
            header: StepHeader::new("config"),
            input: "v2".to_string(),
            host: Arc::clone(&host),
            behavior: Behavior::Succeed,
        });
        let v2 = plan(vec![changed]).unwrap();
        let report = run(&v2, &mut store, &ExecuteOptions::default());
        assert_eq!(report.result("config").unwrap().status, StepStatus::Succeeded);
        assert_eq!(host.calls(), vec!["config", "config"]);
    }

    #[test]
    fn test_drift_reapplies() {
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![ok(&host, "svc", &[])]).unwrap();
        let mut store = StateStore::in_memory();
        run(&plan, &mut store, &ExecuteOptions::default());

        host.drift("svc");
        let report = run(&plan, &mut store, &ExecuteOptions::default());
        assert_eq!(report.result("svc").unwrap().status, StepStatus::Succeeded);
        assert_eq!(host.calls().len(), 2);
    }

    #[test]
    fn test_skip_on_error_blocks_hard_dependents_only() {
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![
            step(
                &host,
                StepHeader::new("cache").policy(FailurePolicy::SkipOnError),
                Behavior::AlwaysFail,
            ),
            ok(&host, "needs-cache", &["cache"]),
            step(&host, StepHeader::new("ordered").after(&["cache"]), Behavior::Succeed),
            ok(&host, "independent", &[]),
        ])
        .unwrap();

        let report = run(&plan, &mut StateStore::in_memory(), &ExecuteOptions::default());
        assert_eq!(report.state, RunState::Partial);
        assert_eq!(report.result("cache").unwrap().status, StepStatus::Failed);

        let blocked = report.result("needs-cache").unwrap();
        assert_eq!(blocked.status, StepStatus::Failed);
        assert_eq!(blocked.error.as_ref().unwrap().kind, ErrorKind::DependencyFailed);
        assert_eq!(blocked.attempts, 0);

        assert_eq!(report.result("ordered").unwrap().status, StepStatus::Succeeded);
        assert_eq!(report.result("independent").unwrap().status, StepStatus::Succeeded);
        assert!(!host.calls().contains(&"needs-cache".to_string()));
    }

    #[test]
    fn test_blocked_step_not_recorded() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![
            step(
                &host,
                StepHeader::new("a").policy(FailurePolicy::SkipOnError),
                Behavior::AlwaysFail,
            ),
            ok(&host, "b", &["a"]),
        ])
        .unwrap();
        let mut store = StateStore::open_locked(dir.path()).unwrap();
        run(&plan, &mut store, &ExecuteOptions::default());
        assert_eq!(store.record().get("a").unwrap().status, StepStatus::Failed);
        assert!(store.record().get("b").is_none());
    }

    #[test]
    fn test_timeout() {
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![step(
            &host,
            StepHeader::new("slow").timeout(Duration::from_millis(50)),
            Behavior::Sleep(Duration::from_millis(300)),
        )])
        .unwrap();

        let report = run(&plan, &mut StateStore::in_memory(), &ExecuteOptions::default());
        let slow = report.result("slow").unwrap();
        assert_eq!(slow.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert!(slow.duration < Duration::from_millis(300));
        assert!(report.state.is_aborted());
        // The run only returns once the worker is gone
        assert_eq!(host.running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timed_out_apply_is_never_overlapped_by_a_retry() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::default());
        let policy = FailurePolicy::RetryThenAbort {
            max: 3,
            backoff: Duration::from_millis(1),
        };
        let plan = plan(vec![step(
            &host,
            StepHeader::new("slow")
                .timeout(Duration::from_millis(50))
                .policy(policy),
            Behavior::Sleep(Duration::from_millis(300)),
        )])
        .unwrap();

        let mut store = StateStore::open_locked(dir.path()).unwrap();
        let report = run(&plan, &mut store, &ExecuteOptions::default());
        let slow = report.result("slow").unwrap();
        assert_eq!(slow.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(slow.attempts, 1);
        assert_eq!(host.calls(), vec!["slow"]);
        assert_eq!(host.peak_running.load(Ordering::SeqCst), 1);
        assert_eq!(host.running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dry_run_applies_nothing() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![ok(&host, "a", &[]), ok(&host, "b", &["a"])]).unwrap();

        let mut store = StateStore::open_locked(dir.path()).unwrap();
        let report = run(&plan, &mut store, &ExecuteOptions::dry_run());
        assert_eq!(report.would_run(), 2);
        assert_eq!(report.state, RunState::Completed);
        assert!(host.calls().is_empty());
        assert!(store.record().steps.is_empty());
        assert!(!dir.path().join("state.json").exists());
    }

    #[test]
    fn test_dry_run_reports_would_skip() {
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![ok(&host, "a", &[]), ok(&host, "b", &["a"])]).unwrap();
        let mut store = StateStore::in_memory();
        run(&plan, &mut store, &ExecuteOptions::default());

        let report = run(&plan, &mut store, &ExecuteOptions::dry_run());
        assert_eq!(report.skipped(), 2);
        assert_eq!(host.calls().len(), 2);
    }

    #[test]
    fn test_cancel_before_start() {
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![ok(&host, "a", &[])]).unwrap();
        let opts = ExecuteOptions::default();
        opts.cancel.cancel();

        let report = run(&plan, &mut StateStore::in_memory(), &opts);
        assert_eq!(report.state, RunState::Cancelled);
        assert_eq!(report.not_started, vec!["a"]);
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_cancel_lets_in_flight_step_finish() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::default());
        let opts = ExecuteOptions::default();
        let plan = plan(vec![
            step(&host, StepHeader::new("first"), Behavior::CancelRun(opts.cancel.clone())),
            ok(&host, "second", &[]),
        ])
        .unwrap();

        let mut store = StateStore::open_locked(dir.path()).unwrap();
        let report = run(&plan, &mut store, &opts);
        assert_eq!(report.state, RunState::Cancelled);
        assert_eq!(report.result("first").unwrap().status, StepStatus::Succeeded);
        assert_eq!(report.not_started, vec!["second"]);
        assert!(store.record().get("first").is_some());
        assert!(store.record().get("second").is_none());
    }

    #[test]
    fn test_verification_failure() {
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![step(&host, StepHeader::new("noop"), Behavior::NoEffect)]).unwrap();
        let report = run(&plan, &mut StateStore::in_memory(), &ExecuteOptions::default());
        let result = report.result("noop").unwrap();
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Verification);
    }

    #[test]
    fn test_exit_code_carried() {
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![step(&host, StepHeader::new("migrate"), Behavior::ExitCode(3))]).unwrap();
        let report = run(&plan, &mut StateStore::in_memory(), &ExecuteOptions::default());
        let error = report.result("migrate").unwrap().error.clone().unwrap();
        assert_eq!(error.kind, ErrorKind::Apply);
        assert_eq!(error.exit_code, Some(3));
    }

    #[test]
    fn test_read_only_store_rejected_for_apply() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![ok(&host, "a", &[])]).unwrap();
        let mut store = StateStore::open_read_only(dir.path()).unwrap();
        let result = execute(&plan, &mut store, &ExecuteOptions::default(), &mut NoProgress);
        assert!(matches!(result, Err(Error::State { .. })));
        assert!(host.calls().is_empty());

        let report = execute(&plan, &mut store, &ExecuteOptions::dry_run(), &mut NoProgress).unwrap();
        assert_eq!(report.would_run(), 1);
    }

    #[test]
    fn test_parallel_waves_respect_dependencies() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![
            ok(&host, "a", &[]),
            ok(&host, "x", &[]),
            ok(&host, "b", &["a"]),
            ok(&host, "c", &["a", "x"]),
            ok(&host, "d", &["b", "c"]),
        ])
        .unwrap();

        let opts = ExecuteOptions {
            jobs: 4,
            ..Default::default()
        };
        let mut store = StateStore::open_locked(dir.path()).unwrap();
        let report = run(&plan, &mut store, &opts);
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.succeeded(), 5);

        let calls = host.calls();
        let pos = |n: &str| calls.iter().position(|c| c == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("x") < pos("c"));
        assert!(pos("b") < pos("d") && pos("c") < pos("d"));

        let again = run(&plan, &mut store, &opts);
        assert_eq!(again.skipped(), 5);
    }

    #[test]
    fn test_parallel_abort_skips_later_waves() {
        let host = Arc::new(FakeHost::default());
        let plan = plan(vec![
            step(&host, StepHeader::new("a"), Behavior::AlwaysFail),
            ok(&host, "b", &[]),
            ok(&host, "c", &["b"]),
        ])
        .unwrap();
        let opts = ExecuteOptions {
            jobs: 2,
            ..Default::default()
        };
        let report = run(&plan, &mut StateStore::in_memory(), &opts);
        assert_eq!(report.state, RunState::Aborted { step: "a".to_string() });
        assert_eq!(report.result("b").unwrap().status, StepStatus::Succeeded);
        assert_eq!(report.not_started, vec!["c"]);
    }
}
