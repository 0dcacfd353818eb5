//! Events surfaced to lifecycle observers.

use crate::control::{ControlEvent, proxy_uri};

/// The complete event contract visible to collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The watch on the helper was lost, or the channel failed before a pid
    /// was known.
    LauncherCrashed,
    /// The helper process crashed or became uncontrollable.
    ProcessCrashed {
        /// Pid of the helper.
        pid: u32,
    },
    /// The result of a start attempt.
    Launched {
        /// True once the control channel is ready.
        success: bool,
        /// Pid of the helper, when one was spawned.
        pid: Option<u32>,
    },
    /// Bootstrap progress as a percentage.
    Initializing {
        /// Percentage between 0 and 100.
        progress: u8,
    },
    /// Whether the helper has a working circuit.
    CircuitEstablished(bool),
    /// The proxy URI derived from the helper's first SOCKS listener.
    NewProxyUri(String),
}

impl LifecycleEvent {
    /// Maps a control event onto the lifecycle contract.
    ///
    /// Events without a lifecycle counterpart return `None`.
    #[must_use]
    pub fn from_control(event: &ControlEvent) -> Option<Self> {
        match event {
            ControlEvent::BootstrapProgress(progress) => Some(Self::Initializing {
                progress: *progress,
            }),
            ControlEvent::CircuitEstablished(established) => {
                Some(Self::CircuitEstablished(*established))
            }
            ControlEvent::SocksListeners(listeners) => proxy_uri(listeners).map(Self::NewProxyUri),
            ControlEvent::VersionReply(_)
            | ControlEvent::NetworkLiveness(_)
            | ControlEvent::ClientStatus(_)
            | ControlEvent::GeneralStatus(_)
            | ControlEvent::RawAsync(..)
            | ControlEvent::RawMid(..)
            | ControlEvent::RawEnd(..) => None,
        }
    }
}
