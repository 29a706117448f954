//! Application state definitions.

/// Application operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Dependencies are being connected.
    Starting,
    /// Workers are running and requests are accepted.
    Running,
    /// Intake is closed, in-flight tasks are draining.
    ShuttingDown,
    /// Workers and store are closed.
    Stopped,
}

impl AppState {
    /// Check if the application is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, AppState::Running)
    }

    /// Check if the application is accepting new update requests.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, AppState::Running)
    }

    /// Check if the application is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppState::Stopped)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &'static [AppState] {
        match self {
            AppState::Starting => &[AppState::Running, AppState::Stopped],
            AppState::Running => &[AppState::ShuttingDown],
            AppState::ShuttingDown => &[AppState::Stopped],
            AppState::Stopped => &[],
        }
    }

    pub fn can_transition_to(&self, next: AppState) -> bool {
        self.valid_transitions().contains(&next)
    }
}
