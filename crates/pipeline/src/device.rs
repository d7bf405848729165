//! Fair, capacity-bounded leasing of compute devices.
//!
//! The pool is a fixed list of [`Device`]s, each offering
//! `slots_per_device` concurrent leases. A `tokio::sync::Semaphore` sized
//! to the total slot count provides FIFO queueing across waiters; a small
//! slot table decides which device a granted permit lands on.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    Cpu,
    Accelerator { ordinal: u32 },
}

/// One compute device in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Position in the pool.
    pub index: usize,
    pub kind: DeviceKind,
    /// Configured label, e.g. `"cuda:0"` or `"cpu"`.
    pub label: String,
}

impl Device {
    /// The fallback device used when no accelerator is configured.
    pub fn cpu() -> Self {
        Self {
            index: 0,
            kind: DeviceKind::Cpu,
            label: "cpu".to_string(),
        }
    }

    /// Build a device from a configured label.
    ///
    /// `"cpu"` is the CPU; `"<backend>:<n>"` is accelerator `n`; a bare
    /// backend name is accelerator 0.
    pub fn from_label(index: usize, label: &str) -> Self {
        let label = label.trim().to_ascii_lowercase();
        let kind = if label == "cpu" {
            DeviceKind::Cpu
        } else {
            let ordinal = label
                .rsplit_once(':')
                .and_then(|(_, n)| n.parse().ok())
                .unwrap_or(0);
            DeviceKind::Accelerator { ordinal }
        };
        Self { index, kind, label }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

// ---------------------------------------------------------------------------
// Errors / hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("Timed out after {0:?} waiting for a compute device")]
    Timeout(Duration),

    #[error("Device pool is shut down")]
    Closed,
}

/// Clears transient device state (e.g. cached accelerator memory) after a
/// lease is released.
pub trait DevicePurge: Send + Sync {
    fn purge(&self, device: &Device);
}

impl<F> DevicePurge for F
where
    F: Fn(&Device) + Send + Sync,
{
    fn purge(&self, device: &Device) {
        self(device)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSlotStatus {
    pub label: String,
    pub kind: DeviceKind,
    pub in_use: usize,
    pub capacity: usize,
}

/// Read-only snapshot of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    /// Number of devices.
    pub pool_size: usize,
    /// Total concurrent leases the pool allows.
    pub capacity: usize,
    pub in_use: usize,
    pub free: usize,
    /// Highest concurrent lease count observed since start.
    pub peak_in_use: usize,
    pub devices: Vec<DeviceSlotStatus>,
}

// ---------------------------------------------------------------------------
// DeviceArbiter
// ---------------------------------------------------------------------------

struct SlotTable {
    in_use: Vec<usize>,
    peak: usize,
}

struct Shared {
    devices: Vec<Device>,
    slots_per_device: usize,
    table: Mutex<SlotTable>,
    purge: Option<Arc<dyn DevicePurge>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Schedules per-file inference onto a fixed pool of devices.
pub struct DeviceArbiter {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

impl DeviceArbiter {
    /// Create a pool over `devices`, each with `slots_per_device` slots.
    ///
    /// An empty device list yields a single CPU device; zero slots are
    /// treated as one.
    pub fn new(devices: Vec<Device>, slots_per_device: usize) -> Self {
        let devices = if devices.is_empty() {
            vec![Device::cpu()]
        } else {
            devices
                .into_iter()
                .enumerate()
                .map(|(index, d)| Device { index, ..d })
                .collect()
        };
        let slots_per_device = slots_per_device.max(1);
        let capacity = devices.len() * slots_per_device;

        tracing::info!(
            pool_size = devices.len(),
            slots_per_device,
            capacity,
            "Device pool ready",
        );

        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(SlotTable {
                    in_use: vec![0; devices.len()],
                    peak: 0,
                }),
                devices,
                slots_per_device,
                purge: None,
            }),
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Build a pool from configured labels (see [`Device::from_label`]).
    pub fn from_labels(labels: &[String], slots_per_device: usize) -> Self {
        let devices = labels
            .iter()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, l)| Device::from_label(i, l))
            .collect();
        Self::new(devices, slots_per_device)
    }

    /// Install a hook run after every lease release.
    pub fn with_purge(mut self, purge: Arc<dyn DevicePurge>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.purge = Some(purge);
        }
        self
    }

    pub fn devices(&self) -> &[Device] {
        &self.shared.devices
    }

    pub fn capacity(&self) -> usize {
        self.shared.devices.len() * self.shared.slots_per_device
    }

    /// Wait for a free slot and lease it.
    ///
    /// Waiters are served in arrival order. The hinted device (matched by
    /// label) is preferred when it has a free slot; otherwise the
    /// least-loaded device is chosen. With a `timeout`, gives up with
    /// [`AcquireError::Timeout`] and leaves the queue.
    pub async fn acquire(
        &self,
        hint: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<DeviceLease, AcquireError> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| AcquireError::Timeout(limit))?,
            None => acquire.await,
        }
        .map_err(|_| AcquireError::Closed)?;

        let index = self.claim_slot(hint);
        let device = self.shared.devices[index].clone();
        tracing::debug!(device = %device, "Device lease granted");

        Ok(DeviceLease {
            device,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: DeviceLease) {
        drop(lease);
    }

    fn claim_slot(&self, hint: Option<&str>) -> usize {
        let shared = &self.shared;
        let mut table = shared.lock();
        let hinted = hint.and_then(|h| {
            shared
                .devices
                .iter()
                .position(|d| d.label.eq_ignore_ascii_case(h.trim()))
                .filter(|&i| table.in_use[i] < shared.slots_per_device)
        });

        // Holding a permit guarantees at least one device has room.
        let index = hinted.unwrap_or_else(|| {
            table
                .in_use
                .iter()
                .enumerate()
                .min_by_key(|(_, used)| **used)
                .map(|(i, _)| i)
                .unwrap_or(0)
        });

        table.in_use[index] += 1;
        let total: usize = table.in_use.iter().sum();
        table.peak = table.peak.max(total);
        index
    }

    pub fn status(&self) -> DeviceStatus {
        let shared = &self.shared;
        let table = shared.lock();
        let in_use: usize = table.in_use.iter().sum();
        let capacity = self.capacity();

        DeviceStatus {
            pool_size: shared.devices.len(),
            capacity,
            in_use,
            free: capacity.saturating_sub(in_use),
            peak_in_use: table.peak,
            devices: shared
                .devices
                .iter()
                .zip(&table.in_use)
                .map(|(d, used)| DeviceSlotStatus {
                    label: d.label.clone(),
                    kind: d.kind,
                    in_use: *used,
                    capacity: shared.slots_per_device,
                })
                .collect(),
        }
    }

    /// Stop granting leases. Current and future waiters get
    /// [`AcquireError::Closed`]; held leases stay valid until dropped.
    pub fn close(&self) {
        self.permits.close();
        tracing::info!("Device pool closed");
    }
}

// ---------------------------------------------------------------------------
// DeviceLease
// ---------------------------------------------------------------------------

/// Exclusive use of one device slot. Released on drop, including during
/// unwinding, after which the purge hook runs and one waiter is woken.
pub struct DeviceLease {
    device: Device,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl DeviceLease {
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLease")
            .field("device", &self.device.label)
            .finish()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Some(purge) = &self.shared.purge {
            purge.purge(&self.device);
        }
        let mut table = self.shared.lock();
        if let Some(used) = table.in_use.get_mut(self.device.index) {
            *used = used.saturating_sub(1);
        }
        tracing::trace!(device = %self.device, "Device lease released");
        // The permit field drops after this body, waking the next waiter.
    }
}
