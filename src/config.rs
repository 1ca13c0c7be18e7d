use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// How long a transition waits for ledger finality before reporting it pending.
    pub confirmation_timeout: Duration,
    /// Wait slice used while resolving a pending transaction in the background.
    pub resolution_poll: Duration,
    /// Walk the history hash chain on every reconciled read.
    pub verify_chain_on_read: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(30),
            resolution_poll: Duration::from_secs(1),
            verify_chain_on_read: true,
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }
    pub fn with_resolution_poll(mut self, poll: Duration) -> Self {
        self.resolution_poll = poll;
        self
    }
    pub fn with_chain_verification(mut self, verify: bool) -> Self {
        self.verify_chain_on_read = verify;
        self
    }
}
