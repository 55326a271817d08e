//! Scripted stand-ins for the qmaster, its event sources and the cluster
//! command-line tools.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use gridlink::config::BridgeConfig;
use gridlink::master::{EventSource, MasterProbe, Subscription};
use gridlink::submit::{CommandOutput, CommandRunner};
use gridlink::{GridError, Result};

/// A qmaster whose reachability is flipped by the test.
#[derive(Default)]
pub struct FakeProbe {
    up: AtomicBool,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new(up: bool) -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(up),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MasterProbe for FakeProbe {
    async fn probe(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.up.load(Ordering::SeqCst)
    }
}

/// Counts how often it is subscribed and closed; can be told to refuse.
#[derive(Default)]
pub struct FakeSource {
    pub name: String,
    fail: AtomicBool,
    open: Arc<AtomicUsize>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl FakeSource {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Default::default()
        })
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Subscriptions currently held.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeSubscription {
    open: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscription for FakeSubscription {
    async fn close(self: Box<Self>) -> Result<()> {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl EventSource for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GridError::MasterUnavailable);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSubscription {
            open: self.open.clone(),
            closed: self.closed.clone(),
        }))
    }
}

/// Replays scripted outputs in order and records every command line. Once
/// the script runs out the last output is repeated.
pub struct ScriptedRunner {
    outputs: Mutex<VecDeque<CommandOutput>>,
    last: Mutex<Option<CommandOutput>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new(outputs: Vec<CommandOutput>) -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(outputs.into()),
            last: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, argv: &[String], _env: &BTreeMap<String, String>) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(argv.to_vec());
        let next = self.outputs.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(output) => {
                *last = Some(output.clone());
                Ok(output)
            }
            None => Ok(last.clone().unwrap_or_default()),
        }
    }
}

pub fn stdout(text: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: text.to_string(),
        stderr: String::new(),
    }
}

pub fn stderr(status: i32, text: &str) -> CommandOutput {
    CommandOutput {
        status: Some(status),
        stdout: String::new(),
        stderr: text.to_string(),
    }
}

/// A configuration with millisecond timings and its database in `dir`.
pub fn fast_config(dir: &std::path::Path) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.cluster.sge_root = dir.to_path_buf();
    config.monitor.probe_interval_ms = 10;
    config.monitor.probe_timeout_ms = 10;
    config.submit.initial_backoff_ms = 1;
    config.sync.database_path = dir.join("gridlink.db");
    config.sync.work_dir = dir.to_path_buf();
    config.sync.poll_interval_ms = 10;
    config.sync.tail_interval_ms = 10;
    config.accounting.reconnect_delay_ms = 5;
    config
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
