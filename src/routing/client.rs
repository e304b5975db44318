use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;

use crate::error::{BuckError, Result};
use crate::routing::channel::Channel;
use crate::routing::spec::DeskSpec;
use crate::scheduler::{Job, Notice};
use crate::transport::{Envelope, Socket, SocketOptions};

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Version token of a routing table: `base64(json(desk specs))@timestamp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    encoded: String,
    timestamp: i64,
}

impl Signature {
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Nanoseconds since the Unix epoch at which the table was last changed.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn desks(&self) -> Result<Vec<DeskSpec>> {
        let json = BASE64
            .decode(&self.encoded)
            .map_err(|e| BuckError::InvalidSignature(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| BuckError::InvalidSignature(e.to_string()))
    }

    pub fn is_newer_than(&self, other: &Signature) -> bool {
        self.timestamp > other.timestamp
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.encoded, self.timestamp)
    }
}

impl FromStr for Signature {
    type Err = BuckError;

    fn from_str(s: &str) -> Result<Self> {
        let (encoded, timestamp) = s
            .rsplit_once('@')
            .ok_or_else(|| BuckError::InvalidSignature("missing '@timestamp'".to_string()))?;
        let timestamp = timestamp
            .parse()
            .map_err(|_| BuckError::InvalidSignature(format!("bad timestamp {:?}", timestamp)))?;
        Ok(Self {
            encoded: encoded.to_string(),
            timestamp,
        })
    }
}

fn now_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}

/// Routing table plus the sockets used to reach each desk.
///
/// Holds one [`Channel`] per channel name. Sockets are opened on first use
/// and cached per `host:port` for the life of the client.
pub struct Client {
    specs: Vec<DeskSpec>,
    channels: BTreeMap<String, Channel>,
    desks: HashMap<String, DeskSpec>,
    /// `None` while the table has changed since the signature was computed.
    signature: Option<Signature>,
    last_timestamp: i64,
    sockets: HashMap<String, Socket>,
    options: SocketOptions,
    send_timeout: Duration,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("desks", &self.specs)
            .field("signature", &self.signature)
            .field("open_sockets", &self.sockets.len())
            .finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self {
            specs: Vec::new(),
            channels: BTreeMap::new(),
            desks: HashMap::new(),
            signature: None,
            last_timestamp: 0,
            sockets: HashMap::new(),
            options: SocketOptions::client(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl Client {
    /// Build a table from `specs`. The signature is stamped immediately.
    pub fn new(specs: impl IntoIterator<Item = DeskSpec>) -> Self {
        let mut client = Self::default();
        for spec in specs {
            client.add_desk(spec);
        }
        client.signature();
        client
    }

    /// Build a table and push it to every desk in it.
    pub async fn connect(specs: impl IntoIterator<Item = DeskSpec>) -> Result<Self> {
        let mut client = Self::new(specs);
        client.notify_desks().await?;
        Ok(client)
    }

    /// Rebuild an equivalent client from a signature string. Opens no sockets.
    pub fn from_signature(signature: &str) -> Result<Self> {
        let signature: Signature = signature.parse()?;
        let mut client = Self::default();
        for spec in signature.desks()? {
            client.add_desk(spec);
        }
        client.last_timestamp = signature.timestamp;
        client.signature = Some(signature);
        Ok(client)
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.options = self.options.with_max_message_size(max_message_size);
        self
    }

    /// Add a desk to every channel it belongs to. Returns false if it was
    /// already known.
    pub fn add_desk(&mut self, spec: DeskSpec) -> bool {
        if self.specs.contains(&spec) {
            return false;
        }
        for channel in &spec.channels {
            let target = spec.target(channel);
            self.channels
                .entry(channel.clone())
                .or_insert_with(|| Channel::new(channel.clone()))
                .add_target(target.clone());
            self.desks.insert(target, spec.clone());
        }
        tracing::debug!(desk = %spec, "Desk added to routing table");
        self.specs.push(spec);
        self.signature = None;
        true
    }

    pub fn desks(&self) -> &[DeskSpec] {
        &self.specs
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.keys().map(String::as_str).collect()
    }

    fn signature_mut(&mut self) -> &Signature {
        let specs = &self.specs;
        let last_timestamp = &mut self.last_timestamp;
        self.signature.get_or_insert_with(|| {
            let json = serde_json::to_vec(specs).unwrap_or_default();
            // Strictly increasing per client, even within one clock tick.
            let timestamp = now_nanos().max(*last_timestamp + 1);
            *last_timestamp = timestamp;
            Signature {
                encoded: BASE64.encode(json),
                timestamp,
            }
        })
    }

    /// Signature string, recomputed only after the table changed.
    pub fn signature(&mut self) -> String {
        self.signature_mut().to_string()
    }

    pub fn timestamp(&mut self) -> i64 {
        self.signature_mut().timestamp
    }

    /// Signature as last computed, without recomputing.
    pub fn current_signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Override the signature timestamp, e.g. to make an older table win.
    pub fn force_timestamp(&mut self, timestamp: i64) {
        self.signature_mut();
        if let Some(signature) = &mut self.signature {
            signature.timestamp = timestamp;
        }
        self.last_timestamp = timestamp;
    }

    /// Routing target key for `job` in its channel.
    pub fn target_for(&self, job: &Job) -> Result<&str> {
        self.channels
            .get(job.channel())
            .and_then(|channel| channel.get_target(job))
            .ok_or_else(|| BuckError::UnknownChannel(job.channel().to_string()))
    }

    /// Desk that should run `job`.
    pub fn route(&self, job: &Job) -> Result<&DeskSpec> {
        let target = self.target_for(job)?;
        self.desks
            .get(target)
            .ok_or_else(|| BuckError::UnknownChannel(job.channel().to_string()))
    }

    /// Send `job` to the desk its channel routes it to.
    ///
    /// Delivery is best effort. `Ok` means the frame reached the kernel, not
    /// the desk: after a desk goes away the first send on the cached
    /// connection usually still succeeds and that job is lost. The send that
    /// follows fails with [`BuckError::DeliveryFailure`] and evicts the
    /// connection, so the next one reconnects.
    pub async fn send_buck(&mut self, job: &Job) -> Result<()> {
        let spec = self.route(job)?.clone();
        self.deliver(&spec, job).await
    }

    /// Push a topology notice carrying this table's signature to every desk.
    /// Returns how many desks accepted it.
    pub async fn notify_desks(&mut self) -> Result<usize> {
        let notice = Job::notice(Notice::TopologyUpdate {
            signature: self.signature(),
        });

        let mut seen = HashSet::new();
        let mut tried = 0;
        let mut notified = 0;
        for spec in self.specs.clone() {
            if !seen.insert(spec.endpoint()) {
                continue;
            }
            tried += 1;
            match self.deliver(&spec, &notice).await {
                Ok(()) => notified += 1,
                Err(e) => {
                    tracing::warn!(desk = %spec.endpoint(), error = %e, "Topology notification failed");
                }
            }
        }

        if tried > 0 && notified == 0 {
            return Err(BuckError::UnreachableSupervisor(tried));
        }
        tracing::info!(notified, tried, "Desks notified of topology");
        Ok(notified)
    }

    async fn deliver(&mut self, spec: &DeskSpec, job: &Job) -> Result<()> {
        let endpoint = spec.endpoint();
        let timeout = self.send_timeout;

        if !self.sockets.contains_key(&endpoint) {
            let socket = Socket::open(&spec.host, spec.port, self.options.clone()).await?;
            self.sockets.insert(endpoint.clone(), socket);
        }
        let socket = self
            .sockets
            .get_mut(&endpoint)
            .ok_or_else(|| BuckError::SocketSetupFailure {
                addr: endpoint.clone(),
                reason: "socket cache miss".to_string(),
            })?;

        let delivery = socket.send(&Envelope::Job(job.clone()), timeout).await?;
        if !delivery.is_complete() {
            // A broken connection would fail every later send too.
            self.sockets.remove(&endpoint);
            return Err(BuckError::DeliveryFailure {
                target: endpoint,
                written: delivery.written,
                expected: delivery.expected,
            });
        }

        tracing::debug!(job_id = %job.id(), desk = %endpoint, "Job sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::registry::Registry;

    #[test]
    fn signature_round_trips_through_string() {
        let mut client = Client::new([DeskSpec::local(7500), DeskSpec::local(7501)]);
        let text = client.signature();
        let rebuilt = Client::from_signature(&text).unwrap();
        assert_eq!(rebuilt.desks(), client.desks());
        assert_eq!(rebuilt.current_signature().unwrap().to_string(), text);
    }

    #[test]
    fn signature_is_memoized_until_table_changes() {
        let mut client = Client::new([DeskSpec::local(7500)]);
        let first = client.signature();
        assert_eq!(client.signature(), first);

        client.add_desk(DeskSpec::local(7501));
        let second = client.signature();
        assert_ne!(second, first);
        assert!(client.timestamp() > first.parse::<Signature>().unwrap().timestamp());
    }

    #[test]
    fn readding_a_desk_keeps_signature() {
        let mut client = Client::new([DeskSpec::local(7500)]);
        let first = client.signature();
        assert!(!client.add_desk(DeskSpec::local(7500)));
        assert_eq!(client.signature(), first);
    }

    #[test]
    fn same_specs_give_same_encoding() {
        let a = Client::new([DeskSpec::local(7500)]);
        let b = Client::new([DeskSpec::local(7500)]);
        assert_eq!(
            a.current_signature().unwrap().encoded(),
            b.current_signature().unwrap().encoded()
        );
    }

    #[test]
    fn desks_join_each_of_their_channels() {
        let client = Client::new([
            DeskSpec::local(7500).with_channels(["default", "fast"]),
            DeskSpec::local(7501),
        ]);
        assert_eq!(client.channel("default").unwrap().len(), 2);
        assert_eq!(client.channel("fast").unwrap().targets(), &["127.0.0.1:7500/fast"]);
    }

    #[test]
    fn route_resolves_desk_for_channel() {
        let registry = Registry::builtin();
        let client = Client::new([DeskSpec::local(7500).with_channels(["fast"])]);
        let job = Job::call("strlen").arg("x").channel("fast").build(&registry).unwrap();
        assert_eq!(client.route(&job).unwrap().port, 7500);

        let job = Job::call("strlen").arg("x").build(&registry).unwrap();
        assert!(matches!(client.route(&job), Err(BuckError::UnknownChannel(_))));
    }

    #[test]
    fn bad_signatures_are_rejected() {
        assert!(Client::from_signature("no-timestamp").is_err());
        assert!(Client::from_signature("%%%@12").is_err());
    }
}
