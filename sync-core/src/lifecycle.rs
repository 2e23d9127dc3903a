//! Coordinator lifecycle.
//!
//! ```text
//! Uninitialized -> Initializing -> Idle -> Connecting -> Connected | Listening
//!                                   ^-------- stop() --------------'
//! any -> destroy() -> Destroyed
//! ```

use std::fmt;

/// Lifecycle state of a sync coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Nothing configured yet.
    #[default]
    Uninitialized,
    /// Validating identity and family context.
    Initializing,
    /// Ready, not connected.
    Idle,
    /// Opening peer links.
    Connecting,
    /// At least one peer connected.
    Connected,
    /// Active with zero peers, accepting and dialing.
    Listening,
    /// Terminal.
    Destroyed,
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    /// The coordinator has not finished initializing.
    NotInitialized,
    /// The coordinator was destroyed.
    Destroyed,
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::NotInitialized => write!(f, "coordinator not initialized"),
            LifecycleError::Destroyed => write!(f, "coordinator destroyed"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl CoordinatorState {
    /// Enter `Initializing`.
    ///
    /// Re-initializing an idle coordinator is allowed (identity may have
    /// changed after a family was created); an active one must be stopped first.
    pub fn begin_initialize(self) -> Result<Self, LifecycleError> {
        match self {
            Self::Destroyed => Err(LifecycleError::Destroyed),
            Self::Uninitialized | Self::Idle | Self::Initializing => Ok(Self::Initializing),
            active => Ok(active),
        }
    }

    /// Initialization finished, either way.
    pub fn finish_initialize(self, ok: bool) -> Self {
        match (self, ok) {
            (Self::Initializing, true) => Self::Idle,
            (Self::Initializing, false) => Self::Uninitialized,
            (other, _) => other,
        }
    }

    /// Handle `start()`. Starting an active coordinator is a no-op.
    pub fn start(self) -> Result<Self, LifecycleError> {
        match self {
            Self::Destroyed => Err(LifecycleError::Destroyed),
            Self::Uninitialized | Self::Initializing => Err(LifecycleError::NotInitialized),
            Self::Idle => Ok(Self::Connecting),
            active => Ok(active),
        }
    }

    /// Recompute the active state from the number of connected peers.
    pub fn with_peer_count(self, connected: usize) -> Self {
        match self {
            Self::Connecting | Self::Connected | Self::Listening => {
                if connected > 0 {
                    Self::Connected
                } else {
                    Self::Listening
                }
            }
            other => other,
        }
    }

    /// Handle `stop()`. Stopping an idle coordinator is a no-op.
    pub fn stop(self) -> Result<Self, LifecycleError> {
        match self {
            Self::Destroyed => Err(LifecycleError::Destroyed),
            Self::Connecting | Self::Connected | Self::Listening => Ok(Self::Idle),
            other => Ok(other),
        }
    }

    /// Handle `destroy()`. Always succeeds.
    pub fn destroy(self) -> Self {
        Self::Destroyed
    }

    /// Whether the coordinator is started.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Listening)
    }

    /// Whether `initialize` has completed.
    pub fn is_initialized(&self) -> bool {
        !matches!(
            self,
            Self::Uninitialized | Self::Initializing | Self::Destroyed
        )
    }
}
