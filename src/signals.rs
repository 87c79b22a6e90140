// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Environment signals consumed by the batcher and retry queue.
//!
//! The embedding application owns a [`SignalSources`] and pushes transitions
//! into it; components hold the matching [`Signals`] receivers. Signals are
//! `tokio::sync::watch` channels, so a late subscriber always sees the
//! current value and no transition is queued up behind a slow consumer.
//!
//! ```
//! use telemetry_relay::signals::{NetworkSpeed, SignalSources, Visibility};
//!
//! let (sources, signals) = SignalSources::new();
//! sources.set_network_speed(NetworkSpeed::classify("3g"));
//! assert_eq!(signals.network_speed(), NetworkSpeed::ThreeG);
//!
//! sources.set_online(false);
//! assert!(!signals.is_online());
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Coarse connection-quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkSpeed {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl NetworkSpeed {
    /// Map a reported effective-connection-type string. Anything unrecognised is `Unknown`.
    #[must_use]
    pub fn classify(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow-2g" => Self::Slow2g,
            "2g" => Self::TwoG,
            "3g" => Self::ThreeG,
            "4g" => Self::FourG,
            _ => Self::Unknown,
        }
    }

    /// Scale factor applied to the configured max batch size.
    #[must_use]
    pub fn batch_multiplier(&self) -> f64 {
        match self {
            Self::Slow2g => 0.2,
            Self::TwoG => 0.3,
            Self::ThreeG => 0.6,
            Self::FourG | Self::Unknown => 1.0,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slow2g => "slow-2g",
            Self::TwoG => "2g",
            Self::ThreeG => "3g",
            Self::FourG => "4g",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for NetworkSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the hosting context is in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    /// Being hidden or torn down; treat as the last chance to send
    Hidden,
}

/// Sending half, owned by the embedding application.
pub struct SignalSources {
    online: watch::Sender<bool>,
    visibility: watch::Sender<Visibility>,
    network: watch::Sender<NetworkSpeed>,
    wake: watch::Sender<u64>,
}

impl SignalSources {
    /// Create sources starting online, visible, with unknown network speed.
    #[must_use]
    pub fn new() -> (Self, Signals) {
        Self::with_initial(true, Visibility::Visible, NetworkSpeed::Unknown)
    }

    #[must_use]
    pub fn with_initial(online: bool, visibility: Visibility, network: NetworkSpeed) -> (Self, Signals) {
        let (online_tx, online_rx) = watch::channel(online);
        let (vis_tx, vis_rx) = watch::channel(visibility);
        let (net_tx, net_rx) = watch::channel(network);
        let (wake_tx, wake_rx) = watch::channel(0);
        (
            Self {
                online: online_tx,
                visibility: vis_tx,
                network: net_tx,
                wake: wake_tx,
            },
            Signals {
                online: online_rx,
                visibility: vis_rx,
                network: net_rx,
                wake: wake_rx,
            },
        )
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility.send_replace(visibility);
    }

    pub fn set_network_speed(&self, speed: NetworkSpeed) {
        self.network.send_replace(speed);
    }

    /// Host-granted wake-up (e.g. a background sync event). Wakes the retry queue.
    pub fn wake(&self) {
        self.wake.send_modify(|n| *n = n.wrapping_add(1));
    }

    #[must_use]
    pub fn subscribe(&self) -> Signals {
        Signals {
            online: self.online.subscribe(),
            visibility: self.visibility.subscribe(),
            network: self.network.subscribe(),
            wake: self.wake.subscribe(),
        }
    }
}

/// Receiving half, cloned into each component.
#[derive(Clone)]
pub struct Signals {
    pub online: watch::Receiver<bool>,
    pub visibility: watch::Receiver<Visibility>,
    pub network: watch::Receiver<NetworkSpeed>,
    /// Counter bumped on every wake-up
    pub wake: watch::Receiver<u64>,
}

impl Signals {
    /// Signals that never change: online, visible, unknown speed.
    #[must_use]
    pub fn fixed() -> Self {
        let (_sources, signals) = SignalSources::new();
        signals
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        *self.visibility.borrow()
    }

    #[must_use]
    pub fn network_speed(&self) -> NetworkSpeed {
        *self.network.borrow()
    }
}
