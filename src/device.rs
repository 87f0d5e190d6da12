//! Address and configuration state of the device, as changed by standard
//! requests and bus resets.

use crate::{
    catalog::{Catalog, Configuration},
    usb::{EndpointDescriptor, Speed},
};

/// Bus address presented by the device.
///
/// SET_ADDRESS must only take effect once the status stage of the request
/// has been acknowledged, so a new address is held as pending until
/// [DeviceAddress::apply_pending] is called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceAddress {
    current: u8,
    pending: Option<u8>,
}

impl DeviceAddress {
    /// The address the device should currently respond to.
    pub fn current(&self) -> u8 {
        self.current
    }

    pub fn pending(&self) -> Option<u8> {
        self.pending
    }

    pub fn defer(&mut self, address: u8) {
        self.pending = Some(address);
    }

    /// Replace the address right away, discarding any pending one.
    pub fn set_immediate(&mut self, address: u8) {
        self.current = address;
        self.pending = None;
    }

    /// Promote the pending address, returning it if there was one.
    pub fn apply_pending(&mut self) -> Option<u8> {
        let address = self.pending.take()?;
        self.current = address;
        Some(address)
    }
}

/// Handle to the single configuration-changed subscriber. Invoked after
/// every successful SET_CONFIGURATION, including re-selecting the current or
/// zero configuration.
pub struct ConfigurationChanged<'a>(Box<dyn FnMut(&DeviceState<'a>) + 'a>);

impl<'a> ConfigurationChanged<'a> {
    pub fn register(callback: impl FnMut(&DeviceState<'a>) + 'a) -> Self {
        Self(Box::new(callback))
    }
}

/// Per-device state owned by the control endpoint context. Configurations
/// are borrowed from the catalog, never owned.
pub struct DeviceState<'a> {
    catalog: &'a Catalog,
    speed: Speed,
    address: DeviceAddress,
    configuration: Option<&'a Configuration>,
    configuration_changed: Option<ConfigurationChanged<'a>>,
}

impl<'a> DeviceState<'a> {
    /// Create the state of a freshly reset device at the given speed.
    pub fn new(catalog: &'a Catalog, speed: Speed) -> Self {
        Self {
            catalog,
            speed,
            address: DeviceAddress::default(),
            configuration: None,
            configuration_changed: None,
        }
    }

    pub fn with_listener(
        catalog: &'a Catalog,
        speed: Speed,
        listener: ConfigurationChanged<'a>,
    ) -> Self {
        Self {
            configuration_changed: Some(listener),
            ..Self::new(catalog, speed)
        }
    }

    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    /// Negotiated bus speed
    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn configuration(&self) -> Option<&'a Configuration> {
        self.configuration
    }

    /// 0 when unconfigured, otherwise the active configuration value.
    pub fn configuration_number(&self) -> u8 {
        self.configuration.map_or(0, Configuration::value)
    }

    pub fn is_configured(&self) -> bool {
        self.configuration.is_some()
    }

    /// Return to the default state: address 0, unconfigured, running at
    /// the newly negotiated speed.
    pub fn bus_reset(&mut self, speed: Speed) {
        log::debug!("Bus reset at {speed:?} speed");
        self.speed = speed;
        self.address = DeviceAddress::default();
        self.configuration = None;
    }

    /// Select configuration `number` at the current speed; 0 deconfigures.
    /// Returns false without touching the state when no such configuration
    /// exists.
    pub fn set_configuration(&mut self, number: u8) -> bool {
        let configuration = if number == 0 {
            None
        } else {
            let Some(config) = self.catalog.configuration(self.speed, number) else {
                log::debug!("No configuration {number} at {:?} speed", self.speed);
                return false;
            };
            Some(config)
        };

        if self.configuration_number() != number {
            log::debug!("Configuration changed to {number}");
        }
        self.configuration = configuration;

        if let Some(mut listener) = self.configuration_changed.take() {
            (listener.0)(self);
            self.configuration_changed = Some(listener);
        }
        true
    }

    /// Record an address assigned by SET_ADDRESS. It is presented only
    /// after [DeviceState::acknowledge_status].
    pub fn set_address_deferred(&mut self, address: u8) {
        log::debug!("Deferring address {address}");
        self.address.defer(address);
    }

    pub fn set_address_immediate(&mut self, address: u8) {
        log::debug!("Setting address {address}");
        self.address.set_immediate(address);
    }

    /// Called by the peripheral layer once a status stage handshake has
    /// completed. Applies and returns any pending address.
    pub fn acknowledge_status(&mut self) -> Option<u8> {
        let applied = self.address.apply_pending();
        if let Some(address) = applied {
            log::debug!("Address {address} applied");
        }
        applied
    }

    /// Endpoint descriptor with `address` in the active configuration.
    pub fn endpoint_descriptor(&self, address: u8) -> Option<&'a EndpointDescriptor> {
        self.configuration?.endpoint(address)
    }
}
