#![allow(dead_code)]

use chrono::NaiveDate;
use sardine_batch::core::{CommandDescriptor, CommandRunner, EngineClient, RetryPolicy, StageContext};
use sardine_batch::io::CheckpointStore;
use sardine_batch::types::{Polarization, SarResult, SceneRecord, Track};
use sardine_batch::ProcessingConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Script = Box<dyn Fn(&CommandDescriptor, u32) -> i32 + Send + Sync>;

/// Fake engine: return codes come from a script, every call is recorded
pub struct ScriptedRunner {
    script: Script,
    calls: Mutex<Vec<(CommandDescriptor, u32)>>,
}

impl ScriptedRunner {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&CommandDescriptor, u32) -> i32 + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(|_, _| 0)
    }

    /// Codes by call order; calls past the end succeed
    pub fn sequence(codes: &[i32]) -> Arc<Self> {
        let codes = codes.to_vec();
        let next = AtomicUsize::new(0);
        Self::new(move |_, _| {
            let i = next.fetch_add(1, Ordering::SeqCst);
            codes.get(i).copied().unwrap_or(0)
        })
    }

    /// Fails every attempt of commands whose label is `label`
    pub fn failing_on(label: &'static str, code: i32) -> Arc<Self> {
        Self::new(move |cmd, _| if cmd.label == label { code } else { 0 })
    }

    pub fn calls(&self) -> Vec<CommandDescriptor> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.label.clone()).collect()
    }

    pub fn attempts_of(&self, label: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(c, _)| c.label == label).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, command: &CommandDescriptor, attempt: u32) -> SarResult<i32> {
        let code = (self.script)(command, attempt);
        self.calls.lock().unwrap().push((command.clone(), attempt));
        Ok(code)
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config(root: &Path) -> ProcessingConfig {
    let mut config = ProcessingConfig::new(root.join("download"), root.join("processing"));
    config.cpus = 2;
    config.toolchain.gpt = Some(PathBuf::from("gpt"));
    config.retry.delay_ms = 0;
    config
}

pub fn context(config: ProcessingConfig, runner: Arc<ScriptedRunner>, store: Arc<dyn CheckpointStore>) -> StageContext {
    let policy = RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(0),
    };
    StageContext::new(Arc::new(config), EngineClient::new(runner, policy), store)
        .with_program("/usr/local/bin/sardine-batch")
}

pub fn scene(identifier: &str, track: u32, date: &str) -> SceneRecord {
    SceneRecord {
        identifier: identifier.to_string(),
        track: Track(track),
        acquisition_date: NaiveDate::parse_from_str(date, "%Y%m%d").unwrap(),
        polarizations: vec![Polarization::VV, Polarization::VH],
    }
}

/// Create an empty file and its parent directories
pub fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"").unwrap();
}

/// Value following `flag` in a command's arguments
pub fn arg_value<'a>(command: &'a CommandDescriptor, flag: &str) -> Option<&'a str> {
    command
        .args
        .windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
