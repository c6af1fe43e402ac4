//! Network gate: connectivity state as an observable signal.
//!
//! The platform layer feeds connectivity changes in with
//! [`NetworkGate::update`]; the engine only reads. No retry logic lives here.

use crate::types::BlockReason;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::debug;

/// Link type of the active connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTransport {
    /// No connection.
    None,
    /// Wi-Fi.
    Wifi,
    /// Cellular data.
    Cellular,
    /// Wired.
    Ethernet,
    /// VPN or anything else.
    Other,
}

/// Snapshot of connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    /// A validated internet connection exists.
    pub online: bool,
    /// The connection is billed by volume.
    pub is_metered: bool,
    /// Link type.
    pub transport: NetworkTransport,
}

impl NetworkState {
    /// No connectivity. An offline link counts as metered.
    #[must_use]
    pub const fn offline() -> Self {
        Self {
            online: false,
            is_metered: true,
            transport: NetworkTransport::None,
        }
    }

    /// Unmetered Wi-Fi.
    #[must_use]
    pub const fn wifi() -> Self {
        Self {
            online: true,
            is_metered: false,
            transport: NetworkTransport::Wifi,
        }
    }

    /// Metered cellular data.
    #[must_use]
    pub const fn cellular() -> Self {
        Self {
            online: true,
            is_metered: true,
            transport: NetworkTransport::Cellular,
        }
    }

    /// `online && (!wifi_only || !is_metered)`
    #[must_use]
    pub const fn is_sync_permitted(&self, wifi_only: bool) -> bool {
        self.online && (!wifi_only || !self.is_metered)
    }

    /// Why a sync is not permitted, if it is not.
    #[must_use]
    pub const fn block_reason(&self, wifi_only: bool) -> Option<BlockReason> {
        if !self.online {
            Some(BlockReason::NetworkUnavailable)
        } else if wifi_only && self.is_metered {
            Some(BlockReason::WifiRequired)
        } else {
            None
        }
    }
}

/// Publishes the current [`NetworkState`] to the engine, together with the
/// user's Wi-Fi-only preference.
#[derive(Debug)]
pub struct NetworkGate {
    state: watch::Sender<NetworkState>,
    wifi_only: AtomicBool,
}

impl NetworkGate {
    /// Creates a gate reporting `initial`.
    #[must_use]
    pub fn new(initial: NetworkState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            wifi_only: AtomicBool::new(false),
        }
    }

    /// Whether metered connections are refused.
    #[must_use]
    pub fn wifi_only(&self) -> bool {
        self.wifi_only.load(Ordering::Relaxed)
    }

    /// Sets the Wi-Fi-only preference.
    pub fn set_wifi_only(&self, wifi_only: bool) {
        self.wifi_only.store(wifi_only, Ordering::Relaxed);
    }

    /// Checks the current state against the stored preference.
    ///
    /// # Errors
    ///
    /// Returns the [`BlockReason`] when syncing is not permitted.
    pub fn permit(&self) -> Result<(), BlockReason> {
        self.check(self.wifi_only())
    }

    /// Current connectivity.
    #[must_use]
    pub fn current_state(&self) -> NetworkState {
        *self.state.borrow()
    }

    /// Whether a sync may run now under the given Wi-Fi policy.
    #[must_use]
    pub fn is_sync_permitted(&self, wifi_only: bool) -> bool {
        self.current_state().is_sync_permitted(wifi_only)
    }

    /// Like [`NetworkGate::is_sync_permitted`], reporting the block reason.
    ///
    /// # Errors
    ///
    /// Returns the [`BlockReason`] when syncing is not permitted.
    pub fn check(&self, wifi_only: bool) -> Result<(), BlockReason> {
        match self.current_state().block_reason(wifi_only) {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Records a connectivity change. Subscribers are only woken on an
    /// actual transition.
    pub fn update(&self, next: NetworkState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(online = next.online, metered = next.is_metered, "network state changed");
        }
    }

    /// Subscribes to connectivity transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }
}

impl Default for NetworkGate {
    fn default() -> Self {
        Self::new(NetworkState::offline())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_matrix() {
        assert!(NetworkState::wifi().is_sync_permitted(true));
        assert!(NetworkState::cellular().is_sync_permitted(false));
        assert!(!NetworkState::cellular().is_sync_permitted(true));
        assert!(!NetworkState::offline().is_sync_permitted(false));
    }

    #[test]
    fn block_reasons() {
        let gate = NetworkGate::default();
        assert_eq!(gate.check(false), Err(BlockReason::NetworkUnavailable));
        gate.update(NetworkState::cellular());
        assert_eq!(gate.check(true), Err(BlockReason::WifiRequired));
        assert_eq!(gate.check(false), Ok(()));

        assert_eq!(gate.permit(), Ok(()));
        gate.set_wifi_only(true);
        assert_eq!(gate.permit(), Err(BlockReason::WifiRequired));
    }

    #[tokio::test]
    async fn subscribers_see_transitions_only() {
        let gate = NetworkGate::new(NetworkState::offline());
        let mut rx = gate.subscribe();

        gate.update(NetworkState::offline());
        assert!(!rx.has_changed().unwrap());

        gate.update(NetworkState::wifi());
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().online);
    }
}
