//! Public types for the data orchestrator.

/// Orchestrator lifecycle state.
///
/// Use [`super::DataOrchestrator::state()`] to check the current state or
/// [`super::DataOrchestrator::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Just created, not yet loaded
    Created,
    /// Running the initial cloud → local → primary reconciliation
    Loading,
    /// Timers running, accepting reads and writes
    Running,
    /// Timers stopped, scheduler draining
    Unloading,
    /// Reactive state cleared; writes rejected
    Unloaded,
}

impl OrchestratorState {
    /// Whether writes are still accepted.
    #[must_use]
    pub fn accepts_writes(&self) -> bool {
        !matches!(self, Self::Unloading | Self::Unloaded)
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Loading => write!(f, "Loading"),
            Self::Running => write!(f, "Running"),
            Self::Unloading => write!(f, "Unloading"),
            Self::Unloaded => write!(f, "Unloaded"),
        }
    }
}
