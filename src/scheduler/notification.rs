use serde::{Deserialize, Serialize};

/// Control-plane payloads carried by notice jobs.
///
/// Only `TopologyUpdate`, `DrawerRefresh` and `WorkerShutdown` drive control
/// flow. The remaining variants travel on the wire but are logged and
/// ignored by supervisors and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// A client routing table, as its signature string.
    TopologyUpdate { signature: String },
    /// Restart the supervisor's worker processes.
    DrawerRefresh,
    /// Make a worker's poll loop exit with `exit_code`.
    WorkerShutdown { exit_code: i32 },
    ContextEnable { context: String },
    ContextDisable { context: String },
    ScaleUp { count: u32 },
    ScaleDown { count: u32 },
}

impl Notice {
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::TopologyUpdate { .. } => "topology_update",
            Notice::DrawerRefresh => "drawer_refresh",
            Notice::WorkerShutdown { .. } => "worker_shutdown",
            Notice::ContextEnable { .. } => "context_enable",
            Notice::ContextDisable { .. } => "context_disable",
            Notice::ScaleUp { .. } => "scale_up",
            Notice::ScaleDown { .. } => "scale_down",
        }
    }

    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            Notice::ContextEnable { .. }
                | Notice::ContextDisable { .. }
                | Notice::ScaleUp { .. }
                | Notice::ScaleDown { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{priority, Job};

    #[test]
    fn notices_are_urgent_control_jobs() {
        let job = Job::notice(Notice::DrawerRefresh);
        assert!(job.is_control());
        assert_eq!(job.priority(), priority::URGENT);
        assert_eq!(job.notice_ref(), Some(&Notice::DrawerRefresh));
    }

    #[test]
    fn identical_notices_collapse() {
        let a = Job::notice(Notice::WorkerShutdown { exit_code: 3 });
        let b = Job::notice(Notice::WorkerShutdown { exit_code: 3 });
        let c = Job::notice(Notice::WorkerShutdown { exit_code: 4 });
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn wire_tag_is_snake_case() {
        let json = serde_json::to_string(&Notice::ScaleUp { count: 2 }).unwrap();
        assert_eq!(json, r#"{"type":"scale_up","count":2}"#);
        assert!(Notice::ScaleUp { count: 2 }.is_reserved());
        assert!(!Notice::DrawerRefresh.is_reserved());
    }
}
