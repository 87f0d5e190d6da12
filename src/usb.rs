//! USB 2.0 wire-format types (chapter 9): setup packets, request codes and
//! the standard descriptor layouts served over the default control pipe.
pub mod cdc;

use packed_struct::prelude::*;

/// Descriptor type (bDescriptorType, wValue [high byte])
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    Debug = 10,
    InterfaceAssociation = 11,
}

/// Standard request codes (bRequest) from USB 2.0 table 9-4.
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

/// Data transfer direction of a request or endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out = 0x00,
    /// Device to host
    In = 0x80,
}

/// Request type (bmRequestType bits 6..5)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Request recipient (bmRequestType bits 4..0)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Bus speed negotiated during attachment. Selects which set of
/// configurations applies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Speed {
    Full,
    High,
}

impl Speed {
    /// The speed the device is *not* running at, used to answer
    /// OTHER_SPEED_CONFIGURATION requests.
    pub fn other(self) -> Self {
        match self {
            Speed::Full => Speed::High,
            Speed::High => Speed::Full,
        }
    }
}

/// Endpoint transfer type (bmAttributes bits 1..0)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    fn from_attributes(bm_attributes: u8) -> Self {
        match bm_attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Device class codes (assigned by the USB-IF).
/// https://www.usb.org/defined-class-codes
pub enum DeviceClass {
    UseInterface = 0x00,
    Cdc = 0x02,
    Miscellaneous = 0xef,
    VendorSpecific = 0xff,
}

/// Interface class codes (assigned by the USB-IF).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterfaceClass {
    Cdc = 0x02,
    Hid = 0x03,
    CdcData = 0x0a,
    VendorSpecific = 0xff,
}

/// Language identifiers reported in string descriptor zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LangId {
    EnglishUnitedStates = 0x0409,
    EnglishUnitedKingdom = 0x0809,
    German = 0x0407,
    French = 0x040c,
    Japanese = 0x0411,
}

/// bmAttributes bit that must always be set in a configuration descriptor.
pub const CONFIG_ATTR_RESERVED: u8 = 0x80;
/// bmAttributes bit for a self-powered configuration.
pub const SELF_POWERED: u8 = 0x40;
/// bmAttributes bit for a configuration supporting remote wakeup.
pub const REMOTE_WAKEUP: u8 = 0x20;

pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;
pub const DEVICE_QUALIFIER_DESCRIPTOR_SIZE: usize = 10;
pub const CONFIGURATION_DESCRIPTOR_SIZE: usize = 9;
pub const INTERFACE_DESCRIPTOR_SIZE: usize = 9;
pub const INTERFACE_ASSOCIATION_DESCRIPTOR_SIZE: usize = 8;
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = 7;
pub const SETUP_PACKET_SIZE: usize = 8;

/// Offset of wTotalLength inside a configuration descriptor header.
pub const TOTAL_LENGTH_OFFSET: usize = 2;

/// The 8-byte request header that opens every control transfer.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct SetupPacket {
    /// Direction, type and recipient bitmap.
    #[packed_field(bytes = "0")]
    pub bm_request_type: u8,
    /// Request code.
    #[packed_field(bytes = "1")]
    pub b_request: u8,
    /// Request specific value. For GET_DESCRIPTOR the high byte is the
    /// descriptor type and the low byte the descriptor index.
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_value: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_index: Integer<u16, packed_bits::Bits<16>>,
    /// Number of bytes the host expects (IN) or sends (OUT) in the data stage.
    #[packed_field(bytes = "6..=7", endian = "lsb")]
    pub w_length: Integer<u16, packed_bits::Bits<16>>,
}

impl SetupPacket {
    pub fn new(bm_request_type: u8, b_request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            bm_request_type,
            b_request,
            w_value: Integer::from_primitive(value),
            w_index: Integer::from_primitive(index),
            w_length: Integer::from_primitive(length),
        }
    }

    /// Low byte of wValue
    pub fn value_l(&self) -> u8 {
        (self.w_value.to_primitive() & 0x00ff) as u8
    }

    /// High byte of wValue
    pub fn value_h(&self) -> u8 {
        (self.w_value.to_primitive() >> 8) as u8
    }

    pub fn index(&self) -> u16 {
        self.w_index.to_primitive()
    }

    pub fn length(&self) -> u16 {
        self.w_length.to_primitive()
    }

    pub fn direction(&self) -> Direction {
        if self.bm_request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    /// Returns `None` for the reserved recipient values 4..=31.
    pub fn recipient(&self) -> Option<Recipient> {
        match self.bm_request_type & 0x1f {
            0 => Some(Recipient::Device),
            1 => Some(Recipient::Interface),
            2 => Some(Recipient::Endpoint),
            3 => Some(Recipient::Other),
            _ => None,
        }
    }

    pub fn is_standard(&self) -> bool {
        self.kind() == RequestKind::Standard
    }
}

/// The Device Descriptor is the root of the descriptor tree and contains basic
/// device information. It is 18 bytes in size.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "18")]
pub struct DeviceDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// USB release number in binary-coded decimal (2.00 is 0x0200).
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_usb: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_device_class: u8,
    #[packed_field(bytes = "5")]
    pub b_device_sub_class: u8,
    #[packed_field(bytes = "6")]
    pub b_device_protocol: u8,
    /// Maximum packet size for endpoint zero (8, 16, 32 or 64).
    #[packed_field(bytes = "7")]
    pub b_max_packet_size_0: u8,
    #[packed_field(bytes = "8..=9", endian = "lsb")]
    pub id_vendor: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "10..=11", endian = "lsb")]
    pub id_product: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "12..=13", endian = "lsb")]
    pub bcd_device: Integer<u16, packed_bits::Bits<16>>,
    /// String index of the manufacturer, zero if absent.
    #[packed_field(bytes = "14")]
    pub i_manufacturer: u8,
    /// String index of the product, zero if absent.
    #[packed_field(bytes = "15")]
    pub i_product: u8,
    /// String index of the serial number, zero if absent.
    #[packed_field(bytes = "16")]
    pub i_serial_number: u8,
    #[packed_field(bytes = "17")]
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            b_length: DEVICE_DESCRIPTOR_SIZE as u8,
            b_descriptor_type: DescriptorType::Device as u8,
            bcd_usb: Integer::from_primitive(0x0200),
            b_device_class: DeviceClass::UseInterface as u8,
            b_device_sub_class: 0x00,
            b_device_protocol: 0x00,
            b_max_packet_size_0: 64,
            id_vendor: Integer::from_primitive(vendor_id),
            id_product: Integer::from_primitive(product_id),
            bcd_device: Integer::from_primitive(0x0100),
            i_manufacturer: 0x00,
            i_product: 0x00,
            i_serial_number: 0x00,
            b_num_configurations: 0x00,
        }
    }
}

/// Describes how a high-speed capable device would operate at the speed it
/// is not currently running at. Vendor, product and string fields are absent
/// since they do not change with speed.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "10")]
pub struct DeviceQualifierDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_usb: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_device_class: u8,
    #[packed_field(bytes = "5")]
    pub b_device_sub_class: u8,
    #[packed_field(bytes = "6")]
    pub b_device_protocol: u8,
    /// Maximum packet size for endpoint zero at the other speed.
    #[packed_field(bytes = "7")]
    pub b_max_packet_size_0: u8,
    /// Number of other-speed configurations.
    #[packed_field(bytes = "8")]
    pub b_num_configurations: u8,
    /// Reserved, must be zero.
    #[packed_field(bytes = "9")]
    pub b_reserved: u8,
}

impl DeviceQualifierDescriptor {
    pub fn new() -> Self {
        Self {
            b_length: DEVICE_QUALIFIER_DESCRIPTOR_SIZE as u8,
            b_descriptor_type: DescriptorType::DeviceQualifier as u8,
            bcd_usb: Integer::from_primitive(0x0200),
            b_device_class: DeviceClass::UseInterface as u8,
            b_device_sub_class: 0x00,
            b_device_protocol: 0x00,
            b_max_packet_size_0: 64,
            b_num_configurations: 0x00,
            b_reserved: 0x00,
        }
    }

    /// Mirror the speed-independent class fields of the given device
    /// descriptor.
    pub fn for_device(device: &DeviceDescriptor) -> Self {
        Self {
            bcd_usb: device.bcd_usb,
            b_device_class: device.b_device_class,
            b_device_sub_class: device.b_device_sub_class,
            b_device_protocol: device.b_device_protocol,
            b_max_packet_size_0: device.b_max_packet_size_0,
            ..Self::new()
        }
    }
}

impl Default for DeviceQualifierDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Header of a configuration. On the wire it is followed by every interface,
/// class-specific and endpoint descriptor of the configuration, and
/// wTotalLength counts all of them.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct ConfigurationDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_total_length: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_num_interfaces: u8,
    /// Value to select this configuration with SET_CONFIGURATION.
    #[packed_field(bytes = "5")]
    pub b_configuration_value: u8,
    #[packed_field(bytes = "6")]
    pub i_configuration: u8,
    /// D7 is reserved (set), D6 self-powered, D5 remote wakeup.
    #[packed_field(bytes = "7")]
    pub bm_attributes: u8,
    /// Maximum bus power draw in 2mA units (i.e., 50 = 100mA).
    #[packed_field(bytes = "8")]
    pub b_max_power: u8,
}

impl ConfigurationDescriptor {
    pub fn new(configuration_value: u8) -> Self {
        Self {
            b_length: CONFIGURATION_DESCRIPTOR_SIZE as u8,
            b_descriptor_type: DescriptorType::Configuration as u8,
            w_total_length: Integer::from_primitive(CONFIGURATION_DESCRIPTOR_SIZE as u16),
            b_num_interfaces: 0,
            b_configuration_value: configuration_value,
            i_configuration: 0,
            bm_attributes: CONFIG_ATTR_RESERVED,
            b_max_power: 50,
        }
    }
}

#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct InterfaceDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_interface_number: u8,
    #[packed_field(bytes = "3")]
    pub b_alternate_setting: u8,
    /// Endpoints used by this setting, excluding endpoint zero.
    #[packed_field(bytes = "4")]
    pub b_num_endpoints: u8,
    #[packed_field(bytes = "5")]
    pub b_interface_class: u8,
    #[packed_field(bytes = "6")]
    pub b_interface_subclass: u8,
    #[packed_field(bytes = "7")]
    pub b_interface_protocol: u8,
    #[packed_field(bytes = "8")]
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub fn new(number: u8, alternate_setting: u8) -> Self {
        Self {
            b_length: INTERFACE_DESCRIPTOR_SIZE as u8,
            b_descriptor_type: DescriptorType::Interface as u8,
            b_interface_number: number,
            b_alternate_setting: alternate_setting,
            b_num_endpoints: 0,
            b_interface_class: InterfaceClass::VendorSpecific as u8,
            b_interface_subclass: 0,
            b_interface_protocol: 0,
            i_interface: 0,
        }
    }
}

/// Groups consecutive interfaces into one function of a composite device.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct InterfaceAssociationDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_first_interface: u8,
    #[packed_field(bytes = "3")]
    pub b_interface_count: u8,
    #[packed_field(bytes = "4")]
    pub b_function_class: u8,
    #[packed_field(bytes = "5")]
    pub b_function_subclass: u8,
    #[packed_field(bytes = "6")]
    pub b_function_protocol: u8,
    #[packed_field(bytes = "7")]
    pub i_function: u8,
}

impl InterfaceAssociationDescriptor {
    pub fn new(first_interface: u8, interface_count: u8) -> Self {
        Self {
            b_length: INTERFACE_ASSOCIATION_DESCRIPTOR_SIZE as u8,
            b_descriptor_type: DescriptorType::InterfaceAssociation as u8,
            b_first_interface: first_interface,
            b_interface_count: interface_count,
            b_function_class: InterfaceClass::VendorSpecific as u8,
            b_function_subclass: 0,
            b_function_protocol: 0,
            i_function: 0,
        }
    }
}

#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "7")]
pub struct EndpointDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// Bits 3..0 are the endpoint number, bit 7 the direction (1 = IN).
    #[packed_field(bytes = "2")]
    pub b_endpoint_address: u8,
    /// Bits 1..0 are the transfer type. Bits 5..2 are only meaningful for
    /// isochronous endpoints.
    #[packed_field(bytes = "3")]
    pub bm_attributes: u8,
    /// Bits 10..0 are the maximum packet size. Bits 12..11 are the number of
    /// additional transactions per microframe for high-speed periodic
    /// endpoints.
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_max_packet_size: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "6")]
    pub b_interval: u8,
}

impl EndpointDescriptor {
    pub fn new(address: u8, transfer_type: TransferType, max_packet_size: u16) -> Self {
        Self {
            b_length: ENDPOINT_DESCRIPTOR_SIZE as u8,
            b_descriptor_type: DescriptorType::Endpoint as u8,
            b_endpoint_address: address,
            bm_attributes: transfer_type as u8,
            w_max_packet_size: Integer::from_primitive(max_packet_size),
            b_interval: 0,
        }
    }

    pub fn address(&self) -> u8 {
        self.b_endpoint_address
    }

    pub fn number(&self) -> u8 {
        self.b_endpoint_address & 0x0f
    }

    pub fn direction(&self) -> Direction {
        if self.b_endpoint_address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.bm_attributes)
    }

    /// Maximum packet size in bytes, without the high-bandwidth
    /// multiplier bits.
    pub fn max_packet_size(&self) -> u16 {
        self.w_max_packet_size.to_primitive() & 0x07ff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_unpacks_little_endian_fields() {
        // GET_DESCRIPTOR(CONFIGURATION, 0), wLength = 0x00ff
        let raw = [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xff, 0x00];
        let setup = SetupPacket::unpack(&raw).unwrap();
        assert_eq!(setup.b_request, StandardRequest::GetDescriptor as u8);
        assert_eq!(setup.value_h(), DescriptorType::Configuration as u8);
        assert_eq!(setup.value_l(), 0);
        assert_eq!(setup.index(), 0);
        assert_eq!(setup.length(), 0xff);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.recipient(), Some(Recipient::Device));
        assert!(setup.is_standard());
        assert_eq!(setup.pack().unwrap(), raw);
    }

    #[test]
    fn setup_packet_decodes_request_type_bitmap() {
        let setup = SetupPacket::new(0x41, 0x01, 0, 2, 0);
        assert_eq!(setup.direction(), Direction::Out);
        assert_eq!(setup.kind(), RequestKind::Vendor);
        assert_eq!(setup.recipient(), Some(Recipient::Interface));
        assert!(!setup.is_standard());

        let reserved = SetupPacket::new(0x05, 0x00, 0, 0, 0);
        assert_eq!(reserved.recipient(), None);
    }

    #[test]
    fn device_descriptor_layout() {
        let mut desc = DeviceDescriptor::new(0x1d50, 0x604b);
        desc.i_manufacturer = 1;
        desc.i_product = 2;
        desc.b_num_configurations = 1;
        let bytes = desc.pack().unwrap();
        assert_eq!(
            bytes,
            [
                0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x50, 0x1d, 0x4b, 0x60, 0x00,
                0x01, 0x01, 0x02, 0x00, 0x01
            ]
        );
    }

    #[test]
    fn endpoint_descriptor_layout_and_helpers() {
        let ep = EndpointDescriptor::new(0x81, TransferType::Bulk, 512);
        assert_eq!(ep.pack().unwrap(), [0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00]);
        assert_eq!(ep.number(), 1);
        assert_eq!(ep.direction(), Direction::In);
        assert_eq!(ep.transfer_type(), TransferType::Bulk);
        assert_eq!(ep.max_packet_size(), 512);

        let mut hb = EndpointDescriptor::new(0x02, TransferType::Interrupt, 1024);
        hb.w_max_packet_size = Integer::from_primitive(0x1400);
        assert_eq!(hb.max_packet_size(), 1024);
        assert_eq!(hb.direction(), Direction::Out);
    }

    #[test]
    fn qualifier_mirrors_device_class() {
        let mut device = DeviceDescriptor::new(1, 2);
        device.b_device_class = DeviceClass::Miscellaneous as u8;
        device.b_device_sub_class = 0x02;
        device.b_device_protocol = 0x01;
        let qualifier = DeviceQualifierDescriptor::for_device(&device);
        let bytes = qualifier.pack().unwrap();
        assert_eq!(bytes, [0x0a, 0x06, 0x00, 0x02, 0xef, 0x02, 0x01, 0x40, 0x00, 0x00]);
    }

    #[test]
    fn other_speed_flips() {
        assert_eq!(Speed::Full.other(), Speed::High);
        assert_eq!(Speed::High.other(), Speed::Full);
    }
}
