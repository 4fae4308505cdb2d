//! Tracking of the one device the session works with.
//!
//! The registry is pure bookkeeping: it consumes [`DeviceEvent`]s and answers
//! with a [`RegistryAction`] that the session applies. The first supported
//! device to attach becomes current. Later ones are ignored until it detaches.

use super::{AllowList, DeviceDescriptor, DeviceEvent, DeviceIdentity};
use log::{debug, info, warn};

/// Host-side access control for USB devices.
///
/// Hosts that need a runtime grant (a mobile permission dialog, a polkit
/// prompt) answer `request_permission` later with a
/// [`DeviceEvent::PermissionResult`].
pub trait PermissionBroker: Send {
    /// Whether access to the device is already granted.
    fn has_permission(&self, device: &DeviceDescriptor) -> bool;

    /// Ask for access. The answer arrives asynchronously as an event.
    fn request_permission(&self, device: &DeviceDescriptor);
}

/// Broker for desktop hosts where opening a device needs no runtime grant.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImplicitPermission;

impl PermissionBroker for ImplicitPermission {
    fn has_permission(&self, _device: &DeviceDescriptor) -> bool {
        true
    }

    fn request_permission(&self, device: &DeviceDescriptor) {
        debug!("Implicit permission for {device}");
    }
}

/// Permission status of the current device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    /// A request is outstanding.
    Requested,
    /// Access granted.
    Granted,
}

/// What the session has to do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAction {
    /// Nothing changes.
    Ignore,
    /// A permission request was issued for the new current device.
    RequestPermission(DeviceDescriptor),
    /// The current device may be connected.
    Connect(DeviceDescriptor),
    /// Access was refused; the device is no longer current.
    PermissionDenied(DeviceDescriptor),
    /// The current device went away; the session must be torn down.
    TearDown(DeviceDescriptor),
}

#[derive(Debug, Clone)]
struct CurrentDevice {
    descriptor: DeviceDescriptor,
    identity: DeviceIdentity,
    permission: PermissionState,
}

/// Keeps track of the current device and its permission state.
pub struct DeviceRegistry {
    allow: AllowList,
    broker: Box<dyn PermissionBroker>,
    current: Option<CurrentDevice>,
}

fn same_device(a: &DeviceDescriptor, b: &DeviceDescriptor) -> bool {
    a.vendor_id == b.vendor_id && a.product_id == b.product_id && a.locator == b.locator
}

impl DeviceRegistry {
    /// Create a registry using the given allow-list and permission broker.
    pub fn new(allow: AllowList, broker: Box<dyn PermissionBroker>) -> Self {
        Self {
            allow,
            broker,
            current: None,
        }
    }

    /// The allow-list in use.
    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    /// Identity of the current device, if any.
    pub fn current_device(&self) -> Option<&DeviceIdentity> {
        self.current.as_ref().map(|c| &c.identity)
    }

    /// Descriptor of the current device, if any.
    pub fn current_descriptor(&self) -> Option<&DeviceDescriptor> {
        self.current.as_ref().map(|c| &c.descriptor)
    }

    /// Permission status of the current device, if any.
    pub fn permission(&self) -> Option<PermissionState> {
        self.current.as_ref().map(|c| c.permission)
    }

    /// Dispatch an event to the matching handler.
    pub fn handle(&mut self, event: &DeviceEvent) -> RegistryAction {
        match event {
            DeviceEvent::Attached(device) => self.on_attach(device),
            DeviceEvent::Detached(device) => self.on_detach(device),
            DeviceEvent::PermissionResult { device, granted } => {
                self.on_permission_result(device, *granted)
            },
        }
    }

    /// A device appeared.
    pub fn on_attach(&mut self, device: &DeviceDescriptor) -> RegistryAction {
        let Some(identity) = device.identity(&self.allow) else {
            debug!(
                "Unsupported device VID={:04X} PID={:04X} ({})",
                device.vendor_id, device.product_id, device.locator
            );
            return RegistryAction::Ignore;
        };

        if let Some(current) = &self.current {
            if !same_device(&current.descriptor, device) {
                info!(
                    "Ignoring {} ({device}): {} is already active",
                    identity.display_name, current.identity.display_name
                );
            }
            return RegistryAction::Ignore;
        }

        info!(
            "Supported device attached: {} [{}] ({device})",
            identity.display_name, identity.transport_mode
        );

        if self.broker.has_permission(device) {
            self.current = Some(CurrentDevice {
                descriptor: device.clone(),
                identity,
                permission: PermissionState::Granted,
            });
            RegistryAction::Connect(device.clone())
        } else {
            self.current = Some(CurrentDevice {
                descriptor: device.clone(),
                identity,
                permission: PermissionState::Requested,
            });
            info!("Requesting USB permission for {device}");
            self.broker.request_permission(device);
            RegistryAction::RequestPermission(device.clone())
        }
    }

    /// A device disappeared.
    pub fn on_detach(&mut self, device: &DeviceDescriptor) -> RegistryAction {
        match &self.current {
            Some(current) if same_device(&current.descriptor, device) => {
                info!("Device detached: {} ({device})", current.identity.display_name);
                self.current = None;
                RegistryAction::TearDown(device.clone())
            },
            _ => {
                debug!("Detach of non-current device {device} ignored");
                RegistryAction::Ignore
            },
        }
    }

    /// The host answered a permission request.
    pub fn on_permission_result(&mut self, device: &DeviceDescriptor, granted: bool) -> RegistryAction {
        let Some(current) = self.current.as_mut() else {
            debug!("Permission result for {device} without a current device");
            return RegistryAction::Ignore;
        };
        if !same_device(&current.descriptor, device) {
            debug!("Permission result for non-current device {device} ignored");
            return RegistryAction::Ignore;
        }
        if current.permission != PermissionState::Requested {
            debug!("Unsolicited permission result for {device} ignored");
            return RegistryAction::Ignore;
        }

        if granted {
            info!("USB permission granted for {device}");
            current.permission = PermissionState::Granted;
            RegistryAction::Connect(device.clone())
        } else {
            warn!("USB permission denied for {device}");
            self.current = None;
            RegistryAction::PermissionDenied(device.clone())
        }
    }
}
