//! Permission gate for USB device access
//!
//! Some host platforms gate raw access to USB hardware behind a per-device
//! user consent prompt. The request is inherently asynchronous: the bridge
//! submits it with a correlation id and carries on; the decision arrives
//! later on the decision channel and is drained by the manager's event
//! loop, never returned synchronously. Outcomes are cached per device so an
//! already-granted adapter is never re-prompted.

use std::collections::HashMap;

use common::{
    DeviceDescriptor, DeviceKey, PermissionDecision, PermissionState, RequestId, Result, WorkerTx,
};
use tracing::debug;

/// An access request on its way to the host platform.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub request_id: RequestId,
    pub device: DeviceKey,
}

/// Forwards access requests to whatever the host platform uses to arbitrate
/// device access. The matching [`PermissionDecision`] must eventually appear
/// on the decision channel with the same correlation id.
pub trait PermissionBroker: Send + Sync {
    fn submit(&self, request: PermissionRequest) -> Result<()>;
}

/// Broker for hosts that do not arbitrate serial access (plain Linux with
/// the user in the right group): every request resolves to granted, but
/// still asynchronously through the decision channel, so the waiting-state
/// path behaves identically on all platforms.
pub struct AutoApproveBroker {
    decisions: WorkerTx<PermissionDecision>,
}

impl AutoApproveBroker {
    pub fn new(decisions: WorkerTx<PermissionDecision>) -> Self {
        Self { decisions }
    }
}

impl PermissionBroker for AutoApproveBroker {
    fn submit(&self, request: PermissionRequest) -> Result<()> {
        debug!(request = %request.request_id, device = %request.device, "auto-approving access request");
        self.decisions.try_send(PermissionDecision {
            request_id: request.request_id,
            granted: true,
        })
    }
}

/// Per-device permission cache plus the pending-request table.
pub struct PermissionGate {
    broker: Box<dyn PermissionBroker>,
    states: HashMap<DeviceKey, PermissionState>,
    pending: HashMap<RequestId, DeviceKey>,
    next_request_id: u32,
}

impl PermissionGate {
    pub fn new(broker: Box<dyn PermissionBroker>) -> Self {
        Self {
            broker,
            states: HashMap::new(),
            pending: HashMap::new(),
            next_request_id: 1,
        }
    }

    /// Synchronous cache check.
    pub fn has_permission(&self, key: &DeviceKey) -> bool {
        self.state(key).is_granted()
    }

    /// Cached state for one device. This is the only place a caller can
    /// distinguish "no hardware" from "hardware present but inaccessible".
    pub fn state(&self, key: &DeviceKey) -> PermissionState {
        self.states.get(key).copied().unwrap_or_default()
    }

    /// Issue an access request for a device unless one is unnecessary.
    ///
    /// Returns the correlation id of the newly issued request, or `None`
    /// when the device is already granted or a request is already in
    /// flight. A denied device gets a fresh request: denial is recoverable
    /// only through a new explicit ask.
    pub fn request(&mut self, device: &DeviceDescriptor) -> Result<Option<RequestId>> {
        let key = device.key();
        match self.state(&key) {
            PermissionState::Granted => Ok(None),
            PermissionState::Requested(id) => {
                debug!(request = %id, device = %key, "access request already pending");
                Ok(None)
            }
            PermissionState::Unknown | PermissionState::Denied => {
                let id = RequestId(self.next_request_id);
                self.next_request_id += 1;

                self.states.insert(key.clone(), PermissionState::Requested(id));
                self.pending.insert(id, key.clone());

                self.broker.submit(PermissionRequest {
                    request_id: id,
                    device: key,
                })?;
                Ok(Some(id))
            }
        }
    }

    /// Apply a decision delivered by the host platform.
    ///
    /// Returns the affected device and the outcome, or `None` when the
    /// correlation id matches no pending request (stale or foreign
    /// broadcasts are ignored).
    pub fn resolve(&mut self, decision: PermissionDecision) -> Option<(DeviceKey, bool)> {
        let key = self.pending.remove(&decision.request_id)?;
        let state = if decision.granted {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        };
        self.states.insert(key.clone(), state);
        Some((key, decision.granted))
    }
}
