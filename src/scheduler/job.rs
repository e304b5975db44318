use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{BuckError, Result};
use crate::scheduler::notification::Notice;
use crate::worker::registry::{Execution, Registry, NOOP_TARGET};

pub const DEFAULT_CHANNEL: &str = "default";
const MAX_CONTEXT_LEN: usize = 256;

/// Conventional priorities. Any `i32` is accepted; higher runs first.
pub mod priority {
    pub const LOW: i32 = -100;
    pub const NORMAL: i32 = 0;
    pub const HIGH: i32 = 100;
    pub const URGENT: i32 = 1_000;
}

/// Content-derived job identity (SHA-256 hex of target and arguments).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuckId(String);

impl BuckId {
    fn digest(target: &str, serialized: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(target.as_bytes());
        hasher.update(serialized.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// First 64 bits of the digest; stable across processes and restarts.
    pub fn prefix_u64(&self) -> u64 {
        self.0
            .get(..16)
            .and_then(|head| u64::from_str_radix(head, 16).ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Call arguments, applied positionally or by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Args {
    Positional(Vec<Value>),
    Named(BTreeMap<String, Value>),
}

impl Default for Args {
    fn default() -> Self {
        Args::Positional(Vec::new())
    }
}

impl Args {
    pub fn positional(values: Vec<Value>) -> Self {
        Args::Positional(values)
    }

    pub fn named(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Args::Named(pairs.into_iter().collect())
    }

    /// Look up an argument by position, or by name for named arguments.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        match self {
            Args::Positional(values) => values.get(index),
            Args::Named(map) => map.get(name),
        }
    }

    pub fn values(&self) -> Vec<&Value> {
        match self {
            Args::Positional(values) => values.iter().collect(),
            Args::Named(map) => map.values().collect(),
        }
    }

    pub fn is_named(&self) -> bool {
        matches!(self, Args::Named(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Args::Positional(values) => values.len(),
            Args::Named(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_value(&self) -> Value {
        match self {
            Args::Positional(values) => Value::Array(values.clone()),
            Args::Named(map) => Value::Object(map.clone().into_iter().collect()),
        }
    }
}

/// Resource limits applied inside the worker while the job runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub time_limit: Option<Duration>,
    /// Bytes of address space the job may add on top of the worker's usage.
    pub memory_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Call { target: String, args: Args },
    Notice(Notice),
}

/// Immutable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: BuckId,
    priority: i32,
    payload: Payload,
    channel: String,
    context: String,
    limits: Limits,
    routed_by: Option<Uuid>,
}

impl Job {
    /// Start building a job calling `target`.
    pub fn call(target: impl Into<String>) -> JobBuilder {
        JobBuilder::new(target)
    }

    /// Control job carrying `notice`. Notices run at urgent priority.
    pub fn notice(notice: Notice) -> Job {
        let serialized = serde_json::to_string(&notice).unwrap_or_default();
        let id = BuckId::digest(NOOP_TARGET, &serialized);
        Job {
            context: id.to_string(),
            id,
            priority: priority::URGENT,
            payload: Payload::Notice(notice),
            channel: DEFAULT_CHANNEL.to_string(),
            limits: Limits::default(),
            routed_by: None,
        }
    }

    pub fn id(&self) -> &BuckId {
        &self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn target(&self) -> &str {
        match &self.payload {
            Payload::Call { target, .. } => target,
            Payload::Notice(_) => NOOP_TARGET,
        }
    }

    pub fn args(&self) -> Option<&Args> {
        match &self.payload {
            Payload::Call { args, .. } => Some(args),
            Payload::Notice(_) => None,
        }
    }

    pub fn notice_ref(&self) -> Option<&Notice> {
        match &self.payload {
            Payload::Notice(notice) => Some(notice),
            Payload::Call { .. } => None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Supervisor that last rerouted this job, if any.
    pub fn routed_by(&self) -> Option<Uuid> {
        self.routed_by
    }

    /// Control jobs never execute user code and are always owned locally.
    pub fn is_control(&self) -> bool {
        self.target() == NOOP_TARGET
    }

    /// Copy of this job stamped with the rerouting supervisor's id.
    pub fn rerouted_by(&self, desk: Uuid) -> Job {
        Job {
            routed_by: Some(desk),
            ..self.clone()
        }
    }

    /// Run the target. Returns `None` for the no-op sentinel.
    pub fn invoke(&self, registry: &Registry, exec: &mut Execution) -> Result<Option<Value>> {
        let (target, args) = match &self.payload {
            Payload::Notice(_) => return Ok(None),
            Payload::Call { target, args } => (target, args),
        };
        if target == NOOP_TARGET {
            return Ok(None);
        }
        let f = registry
            .resolve(target)
            .ok_or_else(|| BuckError::InvocationFailure {
                target: target.clone(),
                reason: "target is not registered in this worker".to_string(),
            })?;
        let value = f(args, exec)?;
        Ok(Some(value))
    }
}

/// Builder for [`Job`]; validated against a [`Registry`] on `build`.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    target: String,
    args: Args,
    priority: i32,
    channel: String,
    context: Option<String>,
    inherited: Option<String>,
    limits: Limits,
}

impl JobBuilder {
    fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            args: Args::default(),
            priority: priority::NORMAL,
            channel: DEFAULT_CHANNEL.to_string(),
            context: None,
            inherited: None,
            limits: Limits::default(),
        }
    }

    /// Append a positional argument. Switches named arguments to positional.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        match &mut self.args {
            Args::Positional(values) => values.push(value.into()),
            Args::Named(_) => self.args = Args::Positional(vec![value.into()]),
        }
        self
    }

    /// Insert a named argument. Switches positional arguments to named.
    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        match &mut self.args {
            Args::Named(map) => {
                map.insert(name.into(), value.into());
            }
            Args::Positional(_) => {
                self.args = Args::named([(name.into(), value.into())]);
            }
        }
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Explicit execution context; wins over any inherited one.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Context of the job that spawned this one.
    pub fn inherit_context(mut self, context: impl Into<String>) -> Self {
        self.inherited = Some(context.into());
        self
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.limits.time_limit = Some(limit);
        self
    }

    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.limits.memory_limit = Some(bytes);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn build(self, registry: &Registry) -> Result<Job> {
        if self.target.is_empty() || !registry.contains(&self.target) {
            return Err(BuckError::InvalidTarget(self.target));
        }
        if self.channel.is_empty() {
            return Err(BuckError::InvalidTarget(format!(
                "{} has an empty channel name",
                self.target
            )));
        }

        let serialized = serde_json::to_string(&self.args)?;
        let id = BuckId::digest(&self.target, &serialized);

        let context = match self.context.or(self.inherited) {
            Some(context) => validate_context(context)?,
            None => id.to_string(),
        };

        Ok(Job {
            id,
            priority: self.priority,
            payload: Payload::Call {
                target: self.target,
                args: self.args,
            },
            channel: self.channel,
            context,
            limits: self.limits,
            routed_by: None,
        })
    }
}

fn validate_context(context: String) -> Result<String> {
    if context.is_empty() {
        return Err(BuckError::InvalidContext("context is empty".to_string()));
    }
    if context.len() > MAX_CONTEXT_LEN {
        return Err(BuckError::InvalidContext(format!(
            "context is {} bytes, limit is {}",
            context.len(),
            MAX_CONTEXT_LEN
        )));
    }
    if context.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(BuckError::InvalidContext(format!(
            "context {:?} contains whitespace or control characters",
            context
        )));
    }
    Ok(context)
}
