//! Target selection for one scatter-gather call

use std::collections::BTreeSet;

use procbus::ProcessDescriptor;

use crate::identity::Identity;

/// Who gets asked: this process (directly) and which remote ids (over the bus)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetPlan {
    /// Resolve through the local registry, exactly once
    pub local: bool,

    /// Remote instance ids, ascending, never containing this instance's id
    pub remote: Vec<u32>,
}

impl TargetPlan {
    /// Partition a discovery snapshot into local and remote targets
    ///
    /// Only descriptors passing `filter` are eligible; descriptors without an
    /// id cannot be addressed and are skipped.
    pub fn partition<F>(
        processes: &[ProcessDescriptor],
        identity: &Identity,
        filter: F,
        include_self_if_unmanaged: bool,
    ) -> Self
    where
        F: Fn(&ProcessDescriptor) -> bool,
    {
        let mut local = false;
        let mut remote = BTreeSet::new();

        for process in processes.iter().filter(|p| filter(p)) {
            let Some(id) = process.instance_id else {
                continue;
            };
            if Some(id) == identity.instance_id {
                local = true;
            } else {
                remote.insert(id);
            }
        }

        if include_self_if_unmanaged && !identity.is_managed() {
            local = true;
        }

        Self {
            local,
            remote: remote.into_iter().collect(),
        }
    }

    /// Total number of results a successful call yields
    pub fn expected_results(&self) -> usize {
        self.remote.len() + usize::from(self.local)
    }

    pub fn is_empty(&self) -> bool {
        self.expected_results() == 0
    }
}
