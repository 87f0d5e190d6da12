//! Standard request handling on the default control pipe.
//!
//! The peripheral layer stores each SETUP packet in a [ControlEndpoint] and
//! calls [handle_standard_request] once per transfer stage. Handlers fill the
//! endpoint buffer, hand it to a [TransferScheduler] and report OK or STALL.
//!
//! Only one control transfer may be in flight per endpoint: a caller must not
//! deliver a new SETUP while data from the previous one is still being
//! handed to the scheduler. A new SETUP before the previous STATUS stage
//! simply replaces the old request.

use std::{error::Error, fmt};

use packed_struct::{prelude::*, PackingResult};

use crate::{
    catalog::Descriptor,
    device::DeviceState,
    serializer::{serialize_configuration, serialize_string, SerializeError, TruncationPolicy},
    usb::{DescriptorType, Direction, SetupPacket, StandardRequest, SETUP_PACKET_SIZE},
};

/// Control buffer size used by [ControlEndpoint::default]
pub const DEFAULT_BUFFER_CAPACITY: usize = 512;
/// Smaller capacities are rounded up to this.
pub const MIN_BUFFER_CAPACITY: usize = 8;

/// Stage of the control transfer the dispatcher is called for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Setup,
    Data,
    Status,
}

/// Result reported back to the peripheral layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Proceed with the transfer.
    Ok,
    /// Answer the current stage with a STALL handshake.
    Stall,
}

/// Moves bytes across the control endpoint pair. Implemented by the
/// peripheral driver.
pub trait TransferScheduler {
    /// Queue `data` on the IN or OUT half of the control pipe.
    fn schedule_block(&mut self, direction: Direction, data: &[u8]);

    /// Queue a zero-length status stage packet.
    fn schedule_ack(&mut self, direction: Direction);
}

/// Reasons a request is stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    UnsupportedRequest(u8),
    UnsupportedDescriptor { descriptor_type: u8, index: u8 },
    InvalidConfiguration(u8),
    InvalidLength { expected: u16, actual: u16 },
    Serialize(SerializeError),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use RequestError::*;
        match *self {
            UnsupportedRequest(code) => write!(f, "unsupported request {code:#04x}"),
            UnsupportedDescriptor {
                descriptor_type,
                index,
            } => write!(f, "no descriptor of type {descriptor_type:#04x} at index {index}"),
            InvalidConfiguration(number) => write!(f, "no configuration {number}"),
            InvalidLength { expected, actual } => {
                write!(f, "expected wLength {expected}, got {actual}")
            }
            Serialize(ref err) => write!(f, "{err}"),
        }
    }
}

impl Error for RequestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RequestError::Serialize(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SerializeError> for RequestError {
    fn from(err: SerializeError) -> Self {
        RequestError::Serialize(err)
    }
}

/// Default control endpoint context: the SETUP packet of the transfer in
/// flight and the scratch buffer responses are assembled in.
#[derive(Debug, Clone)]
pub struct ControlEndpoint {
    setup: SetupPacket,
    buffer: Box<[u8]>,
    policy: TruncationPolicy,
    reset_address_on_deconfigure: bool,
}

impl ControlEndpoint {
    pub fn new(capacity: usize) -> Self {
        Self {
            setup: SetupPacket::new(0, 0, 0, 0, 0),
            buffer: vec![0; capacity.max(MIN_BUFFER_CAPACITY)].into_boxed_slice(),
            policy: TruncationPolicy::default(),
            reset_address_on_deconfigure: true,
        }
    }

    pub fn with_policy(capacity: usize, policy: TruncationPolicy) -> Self {
        Self {
            policy,
            ..Self::new(capacity)
        }
    }

    /// Whether SET_CONFIGURATION(0) also returns the device to address 0
    /// (default true).
    pub fn reset_address_on_deconfigure(&mut self, enabled: bool) -> &mut Self {
        self.reset_address_on_deconfigure = enabled;
        self
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn policy(&self) -> TruncationPolicy {
        self.policy
    }

    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Start a new control transfer from a raw SETUP packet.
    pub fn receive_setup(&mut self, raw: &[u8; SETUP_PACKET_SIZE]) -> PackingResult<&SetupPacket> {
        self.setup = SetupPacket::unpack(raw)?;
        log::trace!("Setup: {:?}", self.setup);
        Ok(&self.setup)
    }

    pub fn set_setup(&mut self, setup: SetupPacket) {
        self.setup = setup;
    }

    /// See [handle_standard_request]
    pub fn handle_standard_request<T: TransferScheduler + ?Sized>(
        &mut self,
        device: &mut DeviceState,
        transfer: &mut T,
        stage: TransferStage,
    ) -> RequestStatus {
        handle_standard_request(self, device, transfer, stage)
    }
}

impl Default for ControlEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

/// Route the endpoint's current SETUP packet to the matching standard
/// request handler for the given stage.
///
/// GET_DESCRIPTOR, SET_ADDRESS, SET_CONFIGURATION and GET_CONFIGURATION do
/// their work in the SETUP stage; DATA and STATUS stages are acknowledged
/// without further action. Any other request code stalls at every stage.
pub fn handle_standard_request<T: TransferScheduler + ?Sized>(
    endpoint: &mut ControlEndpoint,
    device: &mut DeviceState,
    transfer: &mut T,
    stage: TransferStage,
) -> RequestStatus {
    let code = endpoint.setup.b_request;
    let result = match StandardRequest::from_primitive(code) {
        Some(StandardRequest::GetDescriptor) => get_descriptor(endpoint, device, transfer, stage),
        Some(StandardRequest::SetAddress) => set_address(endpoint, device, transfer, stage),
        Some(StandardRequest::SetConfiguration) => {
            set_configuration(endpoint, device, transfer, stage)
        }
        Some(StandardRequest::GetConfiguration) => {
            get_configuration(endpoint, device, transfer, stage)
        }
        _ => Err(RequestError::UnsupportedRequest(code)),
    };

    match result {
        Ok(()) => RequestStatus::Ok,
        Err(e) => {
            log::debug!("Stalling {stage:?} stage: {e}");
            RequestStatus::Stall
        }
    }
}

/// Send a descriptor on the IN pipe, capped to the length the host asked
/// for and the length the descriptor declares (wTotalLength for
/// configurations), then expect the host's status packet on OUT.
fn send_descriptor<T: TransferScheduler + ?Sized>(
    transfer: &mut T,
    setup: &SetupPacket,
    data: &[u8],
) -> Result<(), RequestError> {
    let mut descriptor_length = data.first().copied().unwrap_or(0) as usize;
    let composite = [
        DescriptorType::Configuration as u8,
        DescriptorType::OtherSpeedConfiguration as u8,
    ];
    if let [_, descriptor_type, lo, hi, ..] = *data {
        if composite.contains(&descriptor_type) {
            descriptor_length = u16::from_le_bytes([lo, hi]) as usize;
        }
    }

    // The declared length may exceed what a truncated buffer holds
    let count = (setup.length() as usize)
        .min(descriptor_length)
        .min(data.len());
    log::debug!("Sending {count} descriptor bytes");
    transfer.schedule_block(Direction::In, &data[..count]);
    transfer.schedule_ack(Direction::Out);
    Ok(())
}

fn get_descriptor<T: TransferScheduler + ?Sized>(
    endpoint: &mut ControlEndpoint,
    device: &mut DeviceState,
    transfer: &mut T,
    stage: TransferStage,
) -> Result<(), RequestError> {
    match stage {
        TransferStage::Setup => get_descriptor_setup(endpoint, device, transfer),
        TransferStage::Data | TransferStage::Status => Ok(()),
    }
}

fn get_descriptor_setup<T: TransferScheduler + ?Sized>(
    endpoint: &mut ControlEndpoint,
    device: &DeviceState,
    transfer: &mut T,
) -> Result<(), RequestError> {
    let setup = endpoint.setup;
    let (type_code, index) = (setup.value_h(), setup.value_l());
    log::debug!("USB Request: GetDescriptor type {type_code:#04x} index {index}");
    let unsupported = RequestError::UnsupportedDescriptor {
        descriptor_type: type_code,
        index,
    };

    // INTERFACE and ENDPOINT descriptors are never served on their own
    let Some(descriptor_type) = DescriptorType::from_primitive(type_code) else {
        return Err(unsupported);
    };
    let Some(descriptor) = device
        .catalog()
        .lookup(device.speed(), descriptor_type, index)
    else {
        return Err(unsupported);
    };

    match descriptor {
        Descriptor::Device(desc) => send_descriptor(transfer, &setup, desc.as_bytes()),
        Descriptor::DeviceQualifier(desc) => send_descriptor(transfer, &setup, desc.as_bytes()),
        Descriptor::Languages(record) => send_descriptor(transfer, &setup, record),
        Descriptor::Configuration(config) => {
            let serialized = serialize_configuration(
                config,
                descriptor_type,
                &mut endpoint.buffer,
                endpoint.policy,
            )?;
            if serialized.is_truncated() {
                log::debug!(
                    "Configuration truncated to {} of {} bytes",
                    serialized.written,
                    serialized.total_length
                );
            }
            send_descriptor(transfer, &setup, &endpoint.buffer[..serialized.written])
        }
        Descriptor::String(text) => {
            let length = serialize_string(text, &mut endpoint.buffer);
            send_descriptor(transfer, &setup, &endpoint.buffer[..length])
        }
    }
}

fn set_address<T: TransferScheduler + ?Sized>(
    endpoint: &mut ControlEndpoint,
    device: &mut DeviceState,
    transfer: &mut T,
    stage: TransferStage,
) -> Result<(), RequestError> {
    match stage {
        TransferStage::Setup => {
            log::debug!("USB Request: SetAddress");
            // Applied once the status stage has been acknowledged
            device.set_address_deferred(endpoint.setup.value_l());
            transfer.schedule_ack(Direction::In);
            Ok(())
        }
        TransferStage::Data | TransferStage::Status => Ok(()),
    }
}

fn set_configuration<T: TransferScheduler + ?Sized>(
    endpoint: &mut ControlEndpoint,
    device: &mut DeviceState,
    transfer: &mut T,
    stage: TransferStage,
) -> Result<(), RequestError> {
    match stage {
        TransferStage::Setup => {
            let number = endpoint.setup.value_l();
            log::debug!("USB Request: SetConfiguration {number}");
            if !device.set_configuration(number) {
                return Err(RequestError::InvalidConfiguration(number));
            }
            if number == 0 && endpoint.reset_address_on_deconfigure {
                device.set_address_immediate(0);
            }
            transfer.schedule_ack(Direction::In);
            Ok(())
        }
        TransferStage::Data | TransferStage::Status => Ok(()),
    }
}

fn get_configuration<T: TransferScheduler + ?Sized>(
    endpoint: &mut ControlEndpoint,
    device: &mut DeviceState,
    transfer: &mut T,
    stage: TransferStage,
) -> Result<(), RequestError> {
    match stage {
        TransferStage::Setup => {
            log::debug!("USB Request: GetConfiguration");
            let length = endpoint.setup.length();
            if length != 1 {
                return Err(RequestError::InvalidLength {
                    expected: 1,
                    actual: length,
                });
            }
            endpoint.buffer[0] = device.configuration_number();
            transfer.schedule_block(Direction::In, &endpoint.buffer[..1]);
            transfer.schedule_ack(Direction::Out);
            Ok(())
        }
        TransferStage::Data | TransferStage::Status => Ok(()),
    }
}
