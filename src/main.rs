use std::error::Error;

use usb_control::{
    catalog::{Catalog, CatalogBuilder, ConfigurationBuilder, EndpointBuilder, InterfaceBuilder},
    device::{ConfigurationChanged, DeviceState},
    request::{ControlEndpoint, RequestStatus, TransferScheduler, TransferStage},
    usb::{DescriptorType, DeviceClass, Direction, LangId, Speed, StandardRequest},
};

/// Scheduler that only logs what a peripheral driver would transmit.
struct LoggingScheduler;

impl TransferScheduler for LoggingScheduler {
    fn schedule_block(&mut self, direction: Direction, data: &[u8]) {
        log::info!("{direction:?} block ({} bytes): {data:02x?}", data.len());
    }

    fn schedule_ack(&mut self, direction: Direction) {
        log::info!("{direction:?} status ack");
    }
}

/// Great Scott Gadgets HackRF One: one vendor-specific interface with a pair
/// of bulk endpoints, at both full and high speed.
fn hackrf_catalog() -> Result<Catalog, Box<dyn Error>> {
    let configuration = |packet_size| {
        ConfigurationBuilder::new(1)
            .string_index(3)
            .max_power(500)
            .interface(
                InterfaceBuilder::new(0)
                    .endpoint(
                        EndpointBuilder::new()
                            .address_num(1)
                            .direction(Direction::In)
                            .max_packet_size(packet_size)
                            .build(),
                    )
                    .endpoint(
                        EndpointBuilder::new()
                            .address_num(2)
                            .direction(Direction::Out)
                            .max_packet_size(packet_size)
                            .build(),
                    ),
            )
            .build()
    };

    CatalogBuilder::new(0x1d50, 0x604b)
        .class(DeviceClass::UseInterface)
        .supported_langs(vec![LangId::EnglishUnitedStates])
        .manufacturer("Great Scott Gadgets")
        .product("HackRF")
        .strings(vec!["Transceiver"])
        .max_packet_size(64)
        .device_release(0x0100)
        .device_qualifier()
        .configuration(Speed::Full, configuration(64)?)
        .configuration(Speed::High, configuration(512)?)
        .build()
}

fn main() -> Result<(), Box<dyn Error>> {
    use simple_logger::SimpleLogger;
    SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init()?;

    let catalog = hackrf_catalog()?;
    let listener = ConfigurationChanged::register(|device: &DeviceState| {
        match device.configuration() {
            Some(config) => {
                for ep in config.endpoints() {
                    log::info!(
                        "Endpoint {:#04x}: {:?}, max packet size {}",
                        ep.address(),
                        ep.transfer_type(),
                        ep.max_packet_size()
                    );
                }
            }
            None => log::info!("Device deconfigured"),
        }
    });
    let mut device = DeviceState::with_listener(&catalog, Speed::Full, listener);
    let mut endpoint = ControlEndpoint::default();
    let mut scheduler = LoggingScheduler;

    device.bus_reset(Speed::High);

    // The usual host enumeration sequence
    let get_descriptor = |descriptor_type: DescriptorType, index: u8, length: u16| {
        let value = (descriptor_type as u16) << 8 | index as u16;
        let mut raw = [0x80, StandardRequest::GetDescriptor as u8, 0, 0, 0, 0, 0, 0];
        raw[2..4].copy_from_slice(&value.to_le_bytes());
        raw[6..8].copy_from_slice(&length.to_le_bytes());
        raw
    };
    let requests = [
        get_descriptor(DescriptorType::Device, 0, 64),
        [0x00, StandardRequest::SetAddress as u8, 0x07, 0, 0, 0, 0, 0],
        get_descriptor(DescriptorType::Device, 0, 18),
        get_descriptor(DescriptorType::DeviceQualifier, 0, 10),
        get_descriptor(DescriptorType::Configuration, 0, 9),
        get_descriptor(DescriptorType::Configuration, 0, 0xff),
        get_descriptor(DescriptorType::OtherSpeedConfiguration, 0, 0xff),
        get_descriptor(DescriptorType::String, 0, 0xff),
        get_descriptor(DescriptorType::String, 2, 0xff),
        [0x00, StandardRequest::SetConfiguration as u8, 0x01, 0, 0, 0, 0, 0],
        [0x80, StandardRequest::GetConfiguration as u8, 0, 0, 0, 0, 0x01, 0],
        [0x80, StandardRequest::GetStatus as u8, 0, 0, 0, 0, 0x02, 0],
    ];

    for raw in requests.iter() {
        let setup = endpoint.receive_setup(raw)?;
        log::info!("Setup: {raw:02x?}");
        if !setup.is_standard() {
            log::warn!("Not a standard request");
            continue;
        }
        for stage in [TransferStage::Setup, TransferStage::Data, TransferStage::Status] {
            let status = endpoint.handle_standard_request(&mut device, &mut scheduler, stage);
            if status == RequestStatus::Stall {
                log::warn!("Request stalled at {stage:?} stage");
                break;
            }
        }
        if let Some(address) = device.acknowledge_status() {
            log::info!("Now at address {address}");
        }
    }

    log::info!(
        "Enumerated at address {} with configuration {}",
        device.address().current(),
        device.configuration_number()
    );
    Ok(())
}
