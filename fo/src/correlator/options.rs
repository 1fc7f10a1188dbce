//! Options for `get_messages`

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use procbus::ProcessDescriptor;

/// Predicate selecting eligible target instances
pub type ProcessFilter = Arc<dyn Fn(&ProcessDescriptor) -> bool + Send + Sync>;

/// Per-call options; anything unset falls back to the correlator's defaults
#[derive(Clone, Default)]
pub struct GetMessagesOptions {
    /// Eligible targets (default: same name as this instance)
    pub filter: Option<ProcessFilter>,

    /// Also resolve locally when this process has no instance id
    pub include_self_if_unmanaged: bool,

    /// Aggregation timeout (default from config, 1000ms)
    pub timeout: Option<Duration>,
}

impl GetMessagesOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ProcessDescriptor) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Target every instance the manager lists
    pub fn all_instances(self) -> Self {
        self.with_filter(|_| true)
    }

    pub fn include_self_if_unmanaged(mut self, include: bool) -> Self {
        self.include_self_if_unmanaged = include;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for GetMessagesOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetMessagesOptions")
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .field("include_self_if_unmanaged", &self.include_self_if_unmanaged)
            .field("timeout", &self.timeout)
            .finish()
    }
}
