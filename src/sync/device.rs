//! Connectivity and battery state consulted before syncing.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    None,
    Wifi,
    Cellular,
    Ethernet,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub connected: bool,
    pub kind: NetworkKind,
    /// Data is billed by volume
    pub metered: bool,
}

impl NetworkState {
    pub fn offline() -> Self {
        Self {
            connected: false,
            kind: NetworkKind::None,
            metered: false,
        }
    }

    pub fn wifi() -> Self {
        Self {
            connected: true,
            kind: NetworkKind::Wifi,
            metered: false,
        }
    }

    pub fn cellular() -> Self {
        Self {
            connected: true,
            kind: NetworkKind::Cellular,
            metered: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    /// Charge level, 0 to 1
    pub level: f32,
    pub charging: bool,
}

impl BatteryState {
    pub fn full() -> Self {
        Self {
            level: 1.0,
            charging: true,
        }
    }
}

pub trait DeviceStatus: Send + Sync {
    fn network(&self) -> NetworkState;
    fn battery(&self) -> BatteryState;
}

/// Device status set by the caller. Desktop hosts report wired, unmetered
/// and on mains power.
#[derive(Debug)]
pub struct FixedDeviceStatus {
    network: Mutex<NetworkState>,
    battery: Mutex<BatteryState>,
}

impl FixedDeviceStatus {
    pub fn new(network: NetworkState, battery: BatteryState) -> Self {
        Self {
            network: Mutex::new(network),
            battery: Mutex::new(battery),
        }
    }

    pub fn set_network(&self, network: NetworkState) {
        *lock(&self.network) = network;
    }

    pub fn set_battery(&self, battery: BatteryState) {
        *lock(&self.battery) = battery;
    }
}

impl Default for FixedDeviceStatus {
    fn default() -> Self {
        Self::new(
            NetworkState {
                connected: true,
                kind: NetworkKind::Ethernet,
                metered: false,
            },
            BatteryState::full(),
        )
    }
}

impl DeviceStatus for FixedDeviceStatus {
    fn network(&self) -> NetworkState {
        *lock(&self.network)
    }

    fn battery(&self) -> BatteryState {
        *lock(&self.battery)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
