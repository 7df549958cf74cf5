//! Shared per-unit dispatch for the stage drivers.
//!
//! Every unit of work goes through the same steps: skip if its marker exists, emit a
//! descriptor in deferred mode, otherwise run it under the output lock and write the
//! marker only after a zero return code.

use crate::core::command::{CommandDescriptor, CommandFactory};
use crate::core::engine::{EngineClient, RetryPolicy};
use crate::io::checkpoint::{CheckpointStore, FsCheckpointStore, OutputLocks, StageOutput};
use crate::io::config::ProcessingConfig;
use crate::io::layout::ProcessingLayout;
use crate::types::{SarError, SarResult};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Lifecycle of one unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    /// Marker found, nothing to do
    Skipped,
    /// Descriptor emitted instead of running
    Deferred,
    Completed,
    /// Best-effort step gave up; no marker, next unit proceeds
    FailedSoft { code: i32 },
    /// Critical step gave up under the continue policy
    FailedHard { message: String },
}

impl UnitState {
    pub fn is_failure(&self) -> bool {
        matches!(self, UnitState::FailedSoft { .. } | UnitState::FailedHard { .. })
    }
}

/// What happens to the run after a hard failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abort with the engine-failure error
    FailFast,
    /// Record the failure and go on with the next unit
    #[default]
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitRecord {
    pub label: String,
    pub output: PathBuf,
    pub state: UnitState,
}

/// Outcome of every unit a stage looked at
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub stage: String,
    pub units: Vec<UnitRecord>,
}

impl StageReport {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            units: Vec::new(),
        }
    }

    pub fn record(&mut self, label: &str, output: &StageOutput, state: UnitState) {
        self.units.push(UnitRecord {
            label: label.to_string(),
            output: output.path().to_path_buf(),
            state,
        });
    }

    pub fn extend(&mut self, other: StageReport) {
        self.units.extend(other.units);
    }

    fn count<F: Fn(&UnitState) -> bool>(&self, predicate: F) -> usize {
        self.units.iter().filter(|u| predicate(&u.state)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|s| *s == UnitState::Completed)
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| *s == UnitState::Skipped)
    }

    pub fn deferred(&self) -> usize {
        self.count(|s| *s == UnitState::Deferred)
    }

    pub fn failed_soft(&self) -> usize {
        self.count(|s| matches!(s, UnitState::FailedSoft { .. }))
    }

    pub fn failed_hard(&self) -> usize {
        self.count(|s| matches!(s, UnitState::FailedHard { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.units.iter().any(|u| u.state.is_failure())
    }
}

impl std::fmt::Display for StageReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} completed, {} skipped, {} deferred, {} soft failures, {} hard failures",
            self.stage,
            self.completed(),
            self.skipped(),
            self.deferred(),
            self.failed_soft(),
            self.failed_hard()
        )
    }
}

/// Collects descriptors emitted in deferred mode, optionally appending them to an exec file
#[derive(Debug, Default)]
pub struct DeferredQueue {
    commands: Mutex<Vec<CommandDescriptor>>,
    exec_file: Option<PathBuf>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that also appends one JSON line per descriptor to `exec_file`
    pub fn with_exec_file<P: Into<PathBuf>>(exec_file: P) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            exec_file: Some(exec_file.into()),
        }
    }

    pub fn exec_file(&self) -> Option<&Path> {
        self.exec_file.as_deref()
    }

    pub fn push(&self, command: CommandDescriptor) -> SarResult<()> {
        let mut commands = self
            .commands
            .lock()
            .map_err(|_| SarError::Processing("deferred queue lock poisoned".to_string()))?;

        // Appended under the queue lock so lines never interleave
        if let Some(exec_file) = &self.exec_file {
            if let Some(dir) = exec_file.parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            let mut file = OpenOptions::new().create(true).append(true).open(exec_file)?;
            writeln!(file, "{}", serde_json::to_string(&command)?)?;
        }

        log::debug!("Deferred: {}", command);
        commands.push(command);
        Ok(())
    }

    pub fn commands(&self) -> Vec<CommandDescriptor> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a stage driver needs, shared for the whole run
#[derive(Clone)]
pub struct StageContext {
    pub config: Arc<ProcessingConfig>,
    pub layout: ProcessingLayout,
    pub engine: EngineClient,
    pub store: Arc<dyn CheckpointStore>,
    pub locks: Arc<OutputLocks>,
    pub deferred: Option<Arc<DeferredQueue>>,
    pub policy: FailurePolicy,
    /// Worker threads for acquisition units
    pub jobs: usize,
    /// CLI executable re-invoked by deferred acquisition units
    pub program: PathBuf,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("layout", &self.layout)
            .field("engine", &self.engine)
            .field("deferred", &self.deferred.is_some())
            .field("policy", &self.policy)
            .field("jobs", &self.jobs)
            .finish()
    }
}

impl StageContext {
    pub fn new(config: Arc<ProcessingConfig>, engine: EngineClient, store: Arc<dyn CheckpointStore>) -> Self {
        let layout = ProcessingLayout::new(&config.processing_dir);
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("sardine-batch"));

        Self {
            config,
            layout,
            engine,
            store,
            locks: Arc::new(OutputLocks::new()),
            deferred: None,
            policy: FailurePolicy::default(),
            jobs: 1,
            program,
        }
    }

    /// Context running real processes with filesystem markers
    pub fn from_config(config: Arc<ProcessingConfig>) -> Self {
        let engine = EngineClient::with_processes(RetryPolicy::from(&config.retry));
        Self::new(config, engine, Arc::new(FsCheckpointStore::new()))
    }

    pub fn with_deferred(mut self, queue: Arc<DeferredQueue>) -> Self {
        self.deferred = Some(queue);
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.program = program.into();
        self
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    pub fn commands(&self) -> CommandFactory<'_> {
        CommandFactory::new(&self.config)
    }

    /// Skip, defer or run a unit whose work is `work`.
    ///
    /// `describe` is only called in deferred mode, `work` only when running inline.
    /// `work` returns the code of the last step: 0 completes the unit, anything else
    /// leaves it failed-soft.
    pub fn process_unit<D, W>(&self, label: &str, output: &StageOutput, describe: D, work: W) -> SarResult<UnitState>
    where
        D: FnOnce() -> SarResult<CommandDescriptor>,
        W: FnOnce() -> SarResult<i32>,
    {
        if self.store.is_complete(output) {
            log::info!("{} already processed ({}), skipping", label, output.path().display());
            return Ok(UnitState::Skipped);
        }

        if let Some(queue) = &self.deferred {
            queue.push(describe()?)?;
            return Ok(UnitState::Deferred);
        }

        let _guard = self.locks.acquire(output.path())?;

        // Another worker may have finished it while we waited
        if self.store.is_complete(output) {
            log::info!("{} already processed ({}), skipping", label, output.path().display());
            return Ok(UnitState::Skipped);
        }

        log::debug!("{}: {:?} -> {:?}", label, UnitState::Pending, UnitState::Running);
        let state = match work() {
            Ok(0) => {
                self.store.mark_complete(output)?;
                UnitState::Completed
            }
            Ok(code) => {
                log::warn!("{} did not complete (code {}), continuing with the next unit", label, code);
                UnitState::FailedSoft { code }
            }
            Err(e) if e.is_engine_failure() => match self.policy {
                FailurePolicy::FailFast => {
                    log::error!("{} failed: {}", label, e);
                    return Err(e);
                }
                FailurePolicy::Continue => {
                    log::error!("{} failed: {}. Continuing with the next unit", label, e);
                    UnitState::FailedHard { message: e.to_string() }
                }
            },
            Err(e) => return Err(e),
        };

        log::debug!("{}: {:?} -> {:?}", label, UnitState::Running, state);
        Ok(state)
    }

    /// Unit whose work is exactly one collaborator command
    pub fn run_command<F>(&self, label: &str, output: &StageOutput, build: F) -> SarResult<UnitState>
    where
        F: FnOnce() -> SarResult<CommandDescriptor>,
    {
        if self.store.is_complete(output) {
            log::info!("{} already processed ({}), skipping", label, output.path().display());
            return Ok(UnitState::Skipped);
        }

        let command = build()?;
        if !self.is_deferred() {
            if let Some(dir) = command.output.parent() {
                std::fs::create_dir_all(dir)?;
            }
        }

        self.process_unit(label, output, || Ok(command.clone()), || self.engine.invoke(&command))
    }

    /// Run a command that has no marker of its own (virtual views); never deferred
    pub fn run_untracked(&self, command: &CommandDescriptor) -> SarResult<i32> {
        if let Some(dir) = command.output.parent() {
            std::fs::create_dir_all(dir)?;
        }

        match self.engine.invoke(command) {
            Err(e) if e.is_engine_failure() && self.policy == FailurePolicy::Continue => {
                log::error!("{} failed: {}", command.label, e);
                Ok(-1)
            }
            other => other,
        }
    }
}
