use std::path::PathBuf;
use std::time::Duration;

use crate::routing::spec::{DeskSpec, DEFAULT_HOST};
use crate::scheduler::job::DEFAULT_CHANNEL;
use crate::transport::DEFAULT_MAX_MESSAGE_SIZE;

pub const DEFAULT_PORT: u16 = 7390;

/// When dead workers are detected and replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReapPolicy {
    /// Check every worker's liveness on every tick.
    #[default]
    Eager,
    /// Check a worker only when its slot is about to receive a job.
    Lazy,
}

/// How a worker process is launched.
///
/// The process is started as `<program> <args...> [--preload b1,b2] [--signature S]`
/// with stdin, stdout and stderr piped to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Target bundles loaded before the worker starts polling.
    pub preload: Vec<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("buckdesk")),
            args: vec!["drawer".to_string()],
            preload: Vec::new(),
        }
    }
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_preload<S: Into<String>>(mut self, bundles: impl IntoIterator<Item = S>) -> Self {
        self.preload.extend(bundles.into_iter().map(Into::into));
        self
    }

    /// Full argument list for one launch.
    pub fn argv(&self, signature: Option<&str>) -> Vec<String> {
        let mut argv = self.args.clone();
        if !self.preload.is_empty() {
            argv.push("--preload".to_string());
            argv.push(self.preload.join(","));
        }
        if let Some(signature) = signature {
            argv.push("--signature".to_string());
            argv.push(signature.to_string());
        }
        argv
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub host: String,
    /// Listening port; 0 picks a free one.
    pub port: u16,
    pub channels: Vec<String>,
    pub pool_size: usize,
    pub reap: ReapPolicy,
    pub max_message_size: usize,
    pub send_timeout: Duration,
    pub tick_timeout: Duration,
    /// How long a worker gets to exit after a shutdown notice before it is killed.
    pub shutdown_grace: Duration,
    pub worker: WorkerCommand,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            channels: vec![DEFAULT_CHANNEL.to_string()],
            pool_size: 4,
            reap: ReapPolicy::Eager,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_timeout: Duration::from_secs(1),
            tick_timeout: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(2),
            worker: WorkerCommand::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_reap(mut self, reap: ReapPolicy) -> Self {
        self.reap = reap;
        self
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_channels<S: Into<String>>(mut self, channels: impl IntoIterator<Item = S>) -> Self {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout = timeout;
        self
    }

    /// Desk spec advertising this supervisor as configured.
    pub fn desk_spec(&self) -> DeskSpec {
        DeskSpec::new(self.host.clone(), self.port).with_channels(self.channels.clone())
    }
}
