//! CDC (Communication Device Class) functional descriptors.
//! https://www.usb.org/document-library/class-definitions-communication-devices-12
//!
//! These are emitted verbatim as the "extra" bytes of the communication
//! interface, between its interface descriptor and its endpoints.

use packed_struct::{prelude::*, PackingResult};

use super::{InterfaceAssociationDescriptor, InterfaceClass, InterfaceDescriptor};

/// bDescriptorType of class-specific interface descriptors.
pub const CS_INTERFACE: u8 = 0x24;

pub enum CdcSubclass {
    None = 0x00,
    DirectLineControlModel = 0x01,
    AbstractControlModel = 0x02,
}

/// bDescriptorSubtype of the functional descriptors below.
pub enum FunctionalSubtype {
    Header = 0x00,
    CallManagement = 0x01,
    AbstractControlManagement = 0x02,
    Union = 0x06,
}

#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "5")]
pub struct HeaderFunctionalDescriptor {
    #[packed_field(bytes = "0")]
    pub b_function_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_descriptor_subtype: u8,
    /// CDC release in binary-coded decimal.
    #[packed_field(bytes = "3..=4", endian = "lsb")]
    pub bcd_cdc: Integer<u16, packed_bits::Bits<16>>,
}

#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "5")]
pub struct CallManagementFunctionalDescriptor {
    #[packed_field(bytes = "0")]
    pub b_function_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_descriptor_subtype: u8,
    #[packed_field(bytes = "3")]
    pub bm_capabilities: u8,
    #[packed_field(bytes = "4")]
    pub b_data_interface: u8,
}

#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "4")]
pub struct AbstractControlManagementFunctionalDescriptor {
    #[packed_field(bytes = "0")]
    pub b_function_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_descriptor_subtype: u8,
    #[packed_field(bytes = "3")]
    pub bm_capabilities: u8,
}

#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "5")]
pub struct UnionFunctionalDescriptor {
    #[packed_field(bytes = "0")]
    pub b_function_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_descriptor_subtype: u8,
    #[packed_field(bytes = "3")]
    pub b_control_interface: u8,
    #[packed_field(bytes = "4")]
    pub b_subordinate_interface0: u8,
}

/// A two-interface CDC-ACM function (communication + data) inside a
/// composite configuration.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AcmFunction {
    pub control_interface: u8,
    pub data_interface: u8,
    /// bmCapabilities of the ACM functional descriptor.
    pub capabilities: u8,
}

impl AcmFunction {
    pub fn new(control_interface: u8, data_interface: u8) -> Self {
        Self {
            control_interface,
            data_interface,
            capabilities: 0x02, // line coding + serial state
        }
    }

    /// The association grouping both interfaces into one function.
    pub fn association(&self) -> InterfaceAssociationDescriptor {
        let mut iad = InterfaceAssociationDescriptor::new(self.control_interface, 2);
        iad.b_function_class = InterfaceClass::Cdc as u8;
        iad.b_function_subclass = CdcSubclass::AbstractControlModel as u8;
        iad
    }

    /// Interface descriptor template for the communication interface.
    pub fn control_interface_descriptor(&self) -> InterfaceDescriptor {
        let mut desc = InterfaceDescriptor::new(self.control_interface, 0);
        desc.b_interface_class = InterfaceClass::Cdc as u8;
        desc.b_interface_subclass = CdcSubclass::AbstractControlModel as u8;
        desc
    }

    /// Interface descriptor template for the data interface.
    pub fn data_interface_descriptor(&self) -> InterfaceDescriptor {
        let mut desc = InterfaceDescriptor::new(self.data_interface, 0);
        desc.b_interface_class = InterfaceClass::CdcData as u8;
        desc
    }

    /// Header, call management, ACM and union descriptors, concatenated in
    /// the order the class specification requires.
    pub fn functional_descriptors(&self) -> PackingResult<Vec<u8>> {
        let header = HeaderFunctionalDescriptor {
            b_function_length: 5,
            b_descriptor_type: CS_INTERFACE,
            b_descriptor_subtype: FunctionalSubtype::Header as u8,
            bcd_cdc: Integer::from_primitive(0x0110),
        };
        let call_management = CallManagementFunctionalDescriptor {
            b_function_length: 5,
            b_descriptor_type: CS_INTERFACE,
            b_descriptor_subtype: FunctionalSubtype::CallManagement as u8,
            bm_capabilities: 0x00,
            b_data_interface: self.data_interface,
        };
        let acm = AbstractControlManagementFunctionalDescriptor {
            b_function_length: 4,
            b_descriptor_type: CS_INTERFACE,
            b_descriptor_subtype: FunctionalSubtype::AbstractControlManagement as u8,
            bm_capabilities: self.capabilities,
        };
        let union = UnionFunctionalDescriptor {
            b_function_length: 5,
            b_descriptor_type: CS_INTERFACE,
            b_descriptor_subtype: FunctionalSubtype::Union as u8,
            b_control_interface: self.control_interface,
            b_subordinate_interface0: self.data_interface,
        };

        let mut data = header.pack_to_vec()?;
        data.extend_from_slice(&call_management.pack()?);
        data.extend_from_slice(&acm.pack()?);
        data.extend_from_slice(&union.pack()?);
        Ok(data)
    }
}
