//! Immutable, speed-indexed descriptor catalog.
//!
//! Every descriptor is packed to its wire form once when the catalog is
//! built, so serving a request only ever copies bytes out of the catalog.

use std::{error::Error, ops::Deref};

use packed_struct::prelude::*;

use crate::usb::{
    ConfigurationDescriptor, DescriptorType, DeviceClass, DeviceDescriptor,
    DeviceQualifierDescriptor, Direction, EndpointDescriptor, InterfaceAssociationDescriptor,
    InterfaceClass, InterfaceDescriptor, LangId, Speed, TransferType, CONFIG_ATTR_RESERVED,
    REMOTE_WAKEUP, SELF_POWERED,
};

/// Longest string that fits a string descriptor (255 byte length field).
pub const MAX_STRING_CHARS: usize = 126;

/// A descriptor together with its wire bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Packed<T> {
    descriptor: T,
    bytes: Vec<u8>,
}

impl<T: PackedStructSlice> Packed<T> {
    /// Pack the descriptor and check that its length byte matches the
    /// encoded size.
    pub fn new(descriptor: T) -> Result<Self, Box<dyn Error>> {
        let bytes = descriptor.pack_to_vec()?;
        check_record_length(&bytes)?;
        Ok(Self { descriptor, bytes })
    }
}

impl<T> Packed<T> {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl<T> Deref for Packed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.descriptor
    }
}

fn check_record_length(bytes: &[u8]) -> Result<(), Box<dyn Error>> {
    let Some(&length) = bytes.first() else {
        return Err("Empty descriptor record".into());
    };
    if length == 0 || length as usize != bytes.len() {
        return Err(format!(
            "Descriptor length byte {length} does not match encoded size {}",
            bytes.len()
        )
        .into());
    }
    Ok(())
}

/// Class or vendor descriptors appended to an interface are a run of
/// length-prefixed records. Each must be non-empty and stay inside the blob.
fn check_extra(extra: &[u8]) -> Result<(), Box<dyn Error>> {
    let mut offset = 0;
    while offset < extra.len() {
        let length = extra[offset] as usize;
        if length < 2 {
            return Err(format!("Invalid descriptor length {length} at extra offset {offset}").into());
        }
        if offset + length > extra.len() {
            return Err(format!(
                "Extra descriptor at offset {offset} overruns blob of {} bytes",
                extra.len()
            )
            .into());
        }
        offset += length;
    }
    Ok(())
}

/// One alternate setting of an interface: the interface descriptor, its
/// class-specific bytes and its endpoints, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceSetting {
    pub descriptor: Packed<InterfaceDescriptor>,
    pub extra: Vec<u8>,
    pub endpoints: Vec<Packed<EndpointDescriptor>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    /// Emitted ahead of the first alternate setting when present.
    pub association: Option<Packed<InterfaceAssociationDescriptor>>,
    pub settings: Vec<InterfaceSetting>,
}

impl Interface {
    pub fn number(&self) -> Option<u8> {
        self.settings
            .first()
            .map(|setting| setting.descriptor.b_interface_number)
    }
}

/// A configuration and the interface tree it owns.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub header: Packed<ConfigurationDescriptor>,
    pub interfaces: Vec<Interface>,
}

impl Configuration {
    /// The value SET_CONFIGURATION selects this configuration with.
    pub fn value(&self) -> u8 {
        self.header.b_configuration_value
    }

    /// Sum of every record length in the tree, i.e. the wTotalLength a
    /// complete serialization reports.
    pub fn total_length(&self) -> usize {
        let mut total = self.header.len();
        for iface in self.interfaces.iter() {
            total += iface.association.as_ref().map_or(0, |a| a.len());
            for setting in iface.settings.iter() {
                total += setting.descriptor.len() + setting.extra.len();
                total += setting.endpoints.iter().map(|ep| ep.len()).sum::<usize>();
            }
        }
        total
    }

    /// All endpoint descriptors in wire order.
    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.interfaces
            .iter()
            .flat_map(|iface| iface.settings.iter())
            .flat_map(|setting| setting.endpoints.iter())
            .map(|ep| ep.deref())
    }

    /// Find the endpoint descriptor with the given address (direction bit
    /// included) in any alternate setting.
    pub fn endpoint(&self, address: u8) -> Option<&EndpointDescriptor> {
        self.endpoints().find(|ep| ep.b_endpoint_address == address)
    }
}

/// A descriptor borrowed from the [Catalog].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Descriptor<'a> {
    Device(&'a Packed<DeviceDescriptor>),
    DeviceQualifier(&'a Packed<DeviceQualifierDescriptor>),
    Configuration(&'a Configuration),
    /// String descriptor zero, already in wire form.
    Languages(&'a [u8]),
    String(&'a str),
}

/// Descriptor tables for one device
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    device: Packed<DeviceDescriptor>,
    device_qualifier: Option<Packed<DeviceQualifierDescriptor>>,
    languages: Vec<u8>,
    strings: Vec<String>,
    full_speed: Vec<Configuration>,
    high_speed: Vec<Configuration>,
}

impl Catalog {
    pub fn device(&self) -> &Packed<DeviceDescriptor> {
        &self.device
    }

    /// `None` for a full-speed only device.
    pub fn device_qualifier(&self) -> Option<&Packed<DeviceQualifierDescriptor>> {
        self.device_qualifier.as_ref()
    }

    pub fn configurations(&self, speed: Speed) -> &[Configuration] {
        match speed {
            Speed::Full => &self.full_speed,
            Speed::High => &self.high_speed,
        }
    }

    /// Select a configuration by its bConfigurationValue.
    pub fn configuration(&self, speed: Speed, value: u8) -> Option<&Configuration> {
        if value == 0 {
            return None;
        }
        self.configurations(speed)
            .iter()
            .find(|config| config.value() == value)
    }

    /// String descriptor zero in wire form.
    pub fn languages(&self) -> &[u8] {
        &self.languages
    }

    /// String descriptor `index` (1-based, index zero is the language list).
    pub fn string(&self, index: u8) -> Option<&str> {
        let position = (index as usize).checked_sub(1)?;
        self.strings.get(position).map(String::as_str)
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    /// Resolve a GET_DESCRIPTOR style (type, index) pair at the given speed.
    ///
    /// Configuration indices are positions in the speed's list, as sent by
    /// the host. OTHER_SPEED_CONFIGURATION reads the list of the speed the
    /// device is not running at.
    pub fn lookup(
        &self,
        speed: Speed,
        descriptor_type: DescriptorType,
        index: u8,
    ) -> Option<Descriptor<'_>> {
        match descriptor_type {
            DescriptorType::Device => Some(Descriptor::Device(&self.device)),
            DescriptorType::DeviceQualifier => {
                self.device_qualifier.as_ref().map(Descriptor::DeviceQualifier)
            }
            DescriptorType::Configuration => self
                .configurations(speed)
                .get(index as usize)
                .map(Descriptor::Configuration),
            DescriptorType::OtherSpeedConfiguration => self
                .configurations(speed.other())
                .get(index as usize)
                .map(Descriptor::Configuration),
            DescriptorType::String => match index {
                0 => Some(Descriptor::Languages(&self.languages)),
                _ => self.string(index).map(Descriptor::String),
            },
            _ => None,
        }
    }
}

/// Builder for an endpoint descriptor
pub struct EndpointBuilder {
    desc: EndpointDescriptor,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self {
            desc: EndpointDescriptor::new(0x00, TransferType::Bulk, 64),
        }
    }

    pub fn build(&self) -> EndpointDescriptor {
        self.desc
    }

    /// Set the endpoint number (bits 3..0 of the address)
    pub fn address_num(&mut self, num: u8) -> &mut Self {
        self.desc.b_endpoint_address = (self.desc.b_endpoint_address & 0x80) | (num & 0x0f);
        self
    }

    pub fn direction(&mut self, direction: Direction) -> &mut Self {
        self.desc.b_endpoint_address = (self.desc.b_endpoint_address & 0x0f) | direction as u8;
        self
    }

    pub fn transfer_type(&mut self, transfer_type: TransferType) -> &mut Self {
        self.desc.bm_attributes = (self.desc.bm_attributes & !0x03) | transfer_type as u8;
        self
    }

    pub fn max_packet_size(&mut self, size: u16) -> &mut Self {
        self.desc.w_max_packet_size = Integer::from_primitive(size);
        self
    }

    pub fn interval(&mut self, interval: u8) -> &mut Self {
        self.desc.b_interval = interval;
        self
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct SettingDraft {
    descriptor: InterfaceDescriptor,
    extra: Vec<u8>,
    endpoints: Vec<EndpointDescriptor>,
}

impl SettingDraft {
    fn new(descriptor: InterfaceDescriptor) -> Self {
        Self {
            descriptor,
            extra: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    fn build(&self, alternate_setting: usize) -> Result<InterfaceSetting, Box<dyn Error>> {
        check_extra(&self.extra)?;
        let mut descriptor = self.descriptor;
        let Ok(alternate_setting) = u8::try_from(alternate_setting) else {
            return Err(format!(
                "Interface {} has more than 256 alternate settings",
                descriptor.b_interface_number
            )
            .into());
        };
        descriptor.b_alternate_setting = alternate_setting;
        descriptor.b_num_endpoints = u8::try_from(self.endpoints.len())?;
        let endpoints = self
            .endpoints
            .iter()
            .map(|ep| Packed::new(*ep))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InterfaceSetting {
            descriptor: Packed::new(descriptor)?,
            extra: self.extra.clone(),
            endpoints,
        })
    }
}

/// [Interface] builder. Class, extra bytes and endpoints apply to the
/// alternate setting most recently started; a new builder starts with
/// setting zero.
#[derive(Debug, Clone)]
pub struct InterfaceBuilder {
    association: Option<InterfaceAssociationDescriptor>,
    finished: Vec<SettingDraft>,
    current: SettingDraft,
}

impl InterfaceBuilder {
    pub fn new(number: u8) -> Self {
        Self::from_descriptor(InterfaceDescriptor::new(number, 0))
    }

    /// Start from a pre-filled interface descriptor template.
    pub fn from_descriptor(descriptor: InterfaceDescriptor) -> Self {
        Self {
            association: None,
            finished: Vec::new(),
            current: SettingDraft::new(descriptor),
        }
    }

    fn build(&self) -> Result<Interface, Box<dyn Error>> {
        let association = self.association.map(Packed::new).transpose()?;
        let settings = self
            .finished
            .iter()
            .chain(std::iter::once(&self.current))
            .enumerate()
            .map(|(alternate_setting, draft)| draft.build(alternate_setting))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Interface {
            association,
            settings,
        })
    }

    /// Begin the next alternate setting. It inherits the class triple of
    /// the previous setting but no extra bytes or endpoints. Settings are
    /// numbered in order when the configuration is built.
    pub fn alternate_setting(&mut self) -> &mut Self {
        let descriptor = self.current.descriptor;
        let previous = std::mem::replace(&mut self.current, SettingDraft::new(descriptor));
        self.finished.push(previous);
        self
    }

    pub fn association(&mut self, association: InterfaceAssociationDescriptor) -> &mut Self {
        self.association = Some(association);
        self
    }

    pub fn class(&mut self, class: InterfaceClass) -> &mut Self {
        self.current.descriptor.b_interface_class = class as u8;
        self
    }

    pub fn subclass(&mut self, subclass: u8) -> &mut Self {
        self.current.descriptor.b_interface_subclass = subclass;
        self
    }

    pub fn protocol(&mut self, protocol: u8) -> &mut Self {
        self.current.descriptor.b_interface_protocol = protocol;
        self
    }

    pub fn string_index(&mut self, index: u8) -> &mut Self {
        self.current.descriptor.i_interface = index;
        self
    }

    /// Append class or vendor descriptors emitted right after the
    /// interface descriptor.
    pub fn extra(&mut self, data: &[u8]) -> &mut Self {
        self.current.extra.extend_from_slice(data);
        self
    }

    pub fn endpoint(&mut self, descriptor: EndpointDescriptor) -> &mut Self {
        self.current.endpoints.push(descriptor);
        self
    }
}

/// [Configuration] builder
pub struct ConfigurationBuilder {
    conf_desc: ConfigurationDescriptor,
    interfaces: Vec<InterfaceBuilder>,
}

impl ConfigurationBuilder {
    pub fn new(configuration_value: u8) -> Self {
        Self {
            conf_desc: ConfigurationDescriptor::new(configuration_value),
            interfaces: Vec::new(),
        }
    }

    /// Pack the configuration tree, filling in bNumInterfaces,
    /// bNumEndpoints and wTotalLength.
    pub fn build(&self) -> Result<Configuration, Box<dyn Error>> {
        let interfaces = self
            .interfaces
            .iter()
            .map(InterfaceBuilder::build)
            .collect::<Result<Vec<_>, _>>()?;

        let mut conf_desc = self.conf_desc;
        conf_desc.b_num_interfaces = u8::try_from(interfaces.len())?;
        let mut config = Configuration {
            header: Packed::new(conf_desc)?,
            interfaces,
        };
        let total = config.total_length();
        let Ok(total) = u16::try_from(total) else {
            return Err(format!("Configuration total length {total} exceeds 65535 bytes").into());
        };
        conf_desc.w_total_length = Integer::from_primitive(total);
        config.header = Packed::new(conf_desc)?;

        log::trace!("Built configuration {}: {total} bytes", conf_desc.b_configuration_value);
        Ok(config)
    }

    pub fn interface(&mut self, iface: &InterfaceBuilder) -> &mut Self {
        self.interfaces.push(iface.clone());
        self
    }

    pub fn string_index(&mut self, index: u8) -> &mut Self {
        self.conf_desc.i_configuration = index;
        self
    }

    pub fn self_powered(&mut self, enabled: bool) -> &mut Self {
        self.set_attribute(SELF_POWERED, enabled);
        self
    }

    pub fn remote_wakeup(&mut self, enabled: bool) -> &mut Self {
        self.set_attribute(REMOTE_WAKEUP, enabled);
        self
    }

    /// Maximum bus power in mA
    pub fn max_power(&mut self, milliamps: u16) -> &mut Self {
        self.conf_desc.b_max_power = (milliamps / 2).min(u8::MAX as u16) as u8;
        self
    }

    fn set_attribute(&mut self, bit: u8, enabled: bool) {
        if enabled {
            self.conf_desc.bm_attributes |= bit;
        } else {
            self.conf_desc.bm_attributes &= !bit;
        }
        self.conf_desc.bm_attributes |= CONFIG_ATTR_RESERVED;
    }
}

/// [Catalog] builder
pub struct CatalogBuilder {
    device_desc: DeviceDescriptor,
    has_qualifier: bool,
    languages: Vec<LangId>,
    strings: Vec<String>,
    full_speed: Vec<Configuration>,
    high_speed: Vec<Configuration>,
}

impl CatalogBuilder {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            device_desc: DeviceDescriptor::new(vendor_id, product_id),
            has_qualifier: false,
            languages: Vec::new(),
            strings: Vec::new(),
            full_speed: Vec::new(),
            high_speed: Vec::new(),
        }
    }

    /// Validate and pack the catalog.
    pub fn build(&self) -> Result<Catalog, Box<dyn Error>> {
        for (speed, configs) in [(Speed::Full, &self.full_speed), (Speed::High, &self.high_speed)] {
            for (i, config) in configs.iter().enumerate() {
                let value = config.value();
                if value == 0 {
                    return Err(format!("{speed:?} speed configuration {i} uses value 0").into());
                }
                if configs[..i].iter().any(|other| other.value() == value) {
                    return Err(
                        format!("Duplicate {speed:?} speed configuration value {value}").into(),
                    );
                }
            }
        }

        if self.strings.len() > u8::MAX as usize {
            return Err(format!("Too many strings: {}", self.strings.len()).into());
        }
        for string in self.strings.iter() {
            if !string.is_ascii() {
                return Err(format!("String {string:?} is not single-byte text").into());
            }
            if string.len() > MAX_STRING_CHARS {
                return Err(format!("String {string:?} is longer than {MAX_STRING_CHARS}").into());
            }
        }

        // bNumConfigurations of the device and qualifier records describe
        // whichever speed the host enumerates at, so the lists must agree
        let (full, high) = (self.full_speed.len(), self.high_speed.len());
        let single_speed = !self.has_qualifier && (full == 0 || high == 0);
        if full != high && !single_speed {
            return Err(format!(
                "Full speed has {full} configurations but high speed has {high}"
            )
            .into());
        }
        let num_configurations = full.max(high);
        let mut device_desc = self.device_desc;
        device_desc.b_num_configurations = u8::try_from(num_configurations)?;

        let device_qualifier = if self.has_qualifier {
            let mut qualifier = DeviceQualifierDescriptor::for_device(&device_desc);
            qualifier.b_num_configurations = device_desc.b_num_configurations;
            Some(Packed::new(qualifier)?)
        } else {
            None
        };

        Ok(Catalog {
            device: Packed::new(device_desc)?,
            device_qualifier,
            languages: self.language_record()?,
            strings: self.strings.clone(),
            full_speed: self.full_speed.clone(),
            high_speed: self.high_speed.clone(),
        })
    }

    fn language_record(&self) -> Result<Vec<u8>, Box<dyn Error>> {
        let languages = if self.languages.is_empty() {
            vec![LangId::EnglishUnitedStates]
        } else {
            self.languages.clone()
        };
        let length = u8::try_from(2 + 2 * languages.len())?;
        let mut record = vec![length, DescriptorType::String as u8];
        for lang in languages {
            record.extend_from_slice(&(lang as u16).to_le_bytes());
        }
        Ok(record)
    }

    pub fn class(&mut self, class: DeviceClass) -> &mut Self {
        self.device_desc.b_device_class = class as u8;
        self
    }

    pub fn subclass(&mut self, subclass: u8) -> &mut Self {
        self.device_desc.b_device_sub_class = subclass;
        self
    }

    pub fn protocol(&mut self, protocol: u8) -> &mut Self {
        self.device_desc.b_device_protocol = protocol;
        self
    }

    /// Set the device's endpoint zero max packet size
    pub fn max_packet_size(&mut self, size: u8) -> &mut Self {
        self.device_desc.b_max_packet_size_0 = size;
        self
    }

    /// Set the device release number (binary-coded decimal)
    pub fn device_release(&mut self, bcd: u16) -> &mut Self {
        self.device_desc.bcd_device = Integer::from_primitive(bcd);
        self
    }

    /// Serve a device qualifier descriptor. Required for high-speed
    /// capable devices.
    pub fn device_qualifier(&mut self) -> &mut Self {
        self.has_qualifier = true;
        self
    }

    pub fn supported_langs(&mut self, langs: Vec<LangId>) -> &mut Self {
        self.languages = langs;
        self
    }

    pub fn manufacturer(&mut self, manufacturer: &str) -> &mut Self {
        self.device_desc.i_manufacturer = self.push_string(manufacturer);
        self
    }

    pub fn product(&mut self, product: &str) -> &mut Self {
        self.device_desc.i_product = self.push_string(product);
        self
    }

    pub fn serial(&mut self, serial: &str) -> &mut Self {
        self.device_desc.i_serial_number = self.push_string(serial);
        self
    }

    /// Append strings referenced by index from configurations or
    /// interfaces. The first string pushed is index 1.
    pub fn strings(&mut self, strings: Vec<&str>) -> &mut Self {
        for string in strings {
            self.push_string(string);
        }
        self
    }

    pub fn configuration(&mut self, speed: Speed, config: Configuration) -> &mut Self {
        match speed {
            Speed::Full => self.full_speed.push(config),
            Speed::High => self.high_speed.push(config),
        }
        self
    }

    fn push_string(&mut self, string: &str) -> u8 {
        self.strings.push(string.to_string());
        // Out of range counts are rejected by build()
        self.strings.len().min(u8::MAX as usize) as u8
    }
}
