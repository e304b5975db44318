use std::collections::HashSet;
use std::net::IpAddr;

use uuid::Uuid;

use crate::routing::{Client, DeskSpec};
use crate::scheduler::Job;
use crate::transport::socket::{is_local_ip, resolve};

/// Why a supervisor kept a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnedBy {
    Control,
    NoClient,
    /// The supervisor has no inbound socket.
    Standalone,
    /// The routing table has no targets for the job's channel.
    UnroutedChannel,
    KnownHost,
    /// This supervisor already rerouted the job once.
    RoutedHere,
    BoundHost,
    LocalAddress,
}

impl OwnedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnedBy::Control => "control",
            OwnedBy::NoClient => "no_client",
            OwnedBy::Standalone => "standalone",
            OwnedBy::UnroutedChannel => "unrouted_channel",
            OwnedBy::KnownHost => "known_host",
            OwnedBy::RoutedHere => "routed_here",
            OwnedBy::BoundHost => "bound_host",
            OwnedBy::LocalAddress => "local_address",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Owned(OwnedBy),
    /// Belongs to another supervisor and must be rerouted there.
    Foreign(DeskSpec),
}

impl Ownership {
    pub fn is_owned(&self) -> bool {
        matches!(self, Ownership::Owned(_))
    }
}

/// Decides ownership and remembers addresses already confirmed as this
/// supervisor's own.
#[derive(Debug, Default)]
pub struct OwnershipCache {
    known_good: HashSet<IpAddr>,
}

impl OwnershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known_hosts(&self) -> &HashSet<IpAddr> {
        &self.known_good
    }

    /// `bound` is this supervisor's listening host and port, if it has a socket.
    pub async fn decide(
        &mut self,
        job: &Job,
        client: Option<&Client>,
        bound: Option<(&str, u16)>,
        desk_id: Uuid,
    ) -> Ownership {
        if job.is_control() {
            return Ownership::Owned(OwnedBy::Control);
        }
        let Some(client) = client else {
            return Ownership::Owned(OwnedBy::NoClient);
        };
        let Some((bound_host, bound_port)) = bound else {
            return Ownership::Owned(OwnedBy::Standalone);
        };
        let spec = match client.route(job) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::debug!(job_id = %job.id(), error = %e, "No route, keeping job");
                return Ownership::Owned(OwnedBy::UnroutedChannel);
            }
        };
        if spec.port != bound_port {
            return Ownership::Foreign(spec.clone());
        }

        let ip = match resolve(&spec.host).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::debug!(host = %spec.host, error = %e, "Could not resolve routed host");
                None
            }
        };

        let owned_by = if ip.is_some_and(|ip| self.known_good.contains(&ip)) {
            Some(OwnedBy::KnownHost)
        } else if job.routed_by() == Some(desk_id) {
            Some(OwnedBy::RoutedHere)
        } else if spec.host == bound_host {
            Some(OwnedBy::BoundHost)
        } else if let Some(ip) = ip {
            is_local_ip(ip).await.then_some(OwnedBy::LocalAddress)
        } else {
            None
        };

        match owned_by {
            Some(owned_by) => {
                if let Some(ip) = ip {
                    self.known_good.insert(ip);
                }
                Ownership::Owned(owned_by)
            }
            None => Ownership::Foreign(spec.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Notice;
    use crate::worker::registry::Registry;

    fn job() -> Job {
        Job::call("strlen").arg("test").build(&Registry::builtin()).unwrap()
    }

    #[tokio::test]
    async fn control_and_unconfigured_jobs_are_owned() {
        let mut cache = OwnershipCache::new();
        let desk = Uuid::new_v4();
        let client = Client::new([DeskSpec::local(7600)]);

        let notice = Job::notice(Notice::DrawerRefresh);
        assert_eq!(
            cache.decide(&notice, Some(&client), Some(("127.0.0.1", 7601)), desk).await,
            Ownership::Owned(OwnedBy::Control)
        );
        assert_eq!(
            cache.decide(&job(), None, Some(("127.0.0.1", 7601)), desk).await,
            Ownership::Owned(OwnedBy::NoClient)
        );
        assert_eq!(
            cache.decide(&job(), Some(&client), None, desk).await,
            Ownership::Owned(OwnedBy::Standalone)
        );
    }

    #[tokio::test]
    async fn other_port_is_foreign() {
        let mut cache = OwnershipCache::new();
        let client = Client::new([DeskSpec::local(7600)]);
        let decision = cache
            .decide(&job(), Some(&client), Some(("127.0.0.1", 7601)), Uuid::new_v4())
            .await;
        assert_eq!(decision, Ownership::Foreign(DeskSpec::local(7600)));
    }

    #[tokio::test]
    async fn same_port_on_bound_host_is_owned_and_cached() {
        let mut cache = OwnershipCache::new();
        let client = Client::new([DeskSpec::local(7600)]);
        let decision = cache
            .decide(&job(), Some(&client), Some(("127.0.0.1", 7600)), Uuid::new_v4())
            .await;
        assert_eq!(decision, Ownership::Owned(OwnedBy::BoundHost));
        assert!(cache.known_hosts().contains(&"127.0.0.1".parse::<IpAddr>().unwrap()));

        let decision = cache
            .decide(&job(), Some(&client), Some(("127.0.0.1", 7600)), Uuid::new_v4())
            .await;
        assert_eq!(decision, Ownership::Owned(OwnedBy::KnownHost));
    }

    #[tokio::test]
    async fn loopback_alias_is_local() {
        let mut cache = OwnershipCache::new();
        let client = Client::new([DeskSpec::new("127.0.0.1", 7600)]);
        let decision = cache
            .decide(&job(), Some(&client), Some(("localhost", 7600)), Uuid::new_v4())
            .await;
        assert_eq!(decision, Ownership::Owned(OwnedBy::LocalAddress));
    }

    #[tokio::test]
    async fn remote_host_on_same_port_is_foreign_unless_routed_here() {
        let mut cache = OwnershipCache::new();
        let desk = Uuid::new_v4();
        let remote = DeskSpec::new("192.0.2.10", 7600);
        let client = Client::new([remote.clone()]);

        let decision = cache
            .decide(&job(), Some(&client), Some(("127.0.0.1", 7600)), desk)
            .await;
        assert_eq!(decision, Ownership::Foreign(remote));

        let rerouted = job().rerouted_by(desk);
        let decision = cache
            .decide(&rerouted, Some(&client), Some(("127.0.0.1", 7600)), desk)
            .await;
        assert_eq!(decision, Ownership::Owned(OwnedBy::RoutedHere));
    }
}
