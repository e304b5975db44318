use crate::scheduler::job::{BuckId, Job};

/// Named consistent-hash ring over an ordered list of targets.
///
/// Routing is a pure function of the job identity and the target order, so
/// any two channels with the same membership agree without coordination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channel {
    name: String,
    targets: Vec<String>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            targets: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a target. Returns false if it is already a member.
    pub fn add_target(&mut self, target: impl Into<String>) -> bool {
        let target = target.into();
        if self.targets.contains(&target) {
            return false;
        }
        self.targets.push(target);
        true
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get_target(&self, job: &Job) -> Option<&str> {
        self.target_for(job.id())
    }

    pub fn target_for(&self, id: &BuckId) -> Option<&str> {
        if self.targets.is_empty() {
            return None;
        }
        let index = (id.prefix_u64() % self.targets.len() as u64) as usize;
        self.targets.get(index).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::registry::Registry;

    #[test]
    fn empty_channel_has_no_target() {
        let registry = Registry::builtin();
        let job = Job::call("strlen").arg("x").build(&registry).unwrap();
        assert!(Channel::new("default").get_target(&job).is_none());
    }

    #[test]
    fn duplicate_targets_are_ignored() {
        let mut channel = Channel::new("default");
        assert!(channel.add_target("a:1/default"));
        assert!(!channel.add_target("a:1/default"));
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn spreads_jobs_over_targets() {
        let registry = Registry::builtin();
        let mut channel = Channel::new("default");
        for port in 1..=4 {
            channel.add_target(format!("h:{}/default", port));
        }
        let hit: std::collections::HashSet<String> = (0..64)
            .map(|i| {
                let job = Job::call("strlen").arg(format!("job-{}", i)).build(&registry).unwrap();
                channel.get_target(&job).unwrap().to_string()
            })
            .collect();
        assert!(hit.len() > 1);
    }
}
