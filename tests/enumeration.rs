use std::{cell::RefCell, rc::Rc};

use usb_control::{
    catalog::{Catalog, CatalogBuilder, ConfigurationBuilder, EndpointBuilder, InterfaceBuilder},
    device::{ConfigurationChanged, DeviceState},
    request::{ControlEndpoint, RequestStatus, TransferScheduler, TransferStage},
    usb::{
        cdc::AcmFunction, DescriptorType, DeviceClass, Direction, LangId, Speed, StandardRequest,
        TransferType,
    },
};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Block(Direction, Vec<u8>),
    Ack(Direction),
}

#[derive(Default)]
struct Recorder {
    events: Vec<Event>,
}

impl TransferScheduler for Recorder {
    fn schedule_block(&mut self, direction: Direction, data: &[u8]) {
        self.events.push(Event::Block(direction, data.to_vec()));
    }

    fn schedule_ack(&mut self, direction: Direction) {
        self.events.push(Event::Ack(direction));
    }
}

/// A host driving one control transfer at a time through every stage.
struct Host<'a> {
    endpoint: ControlEndpoint,
    device: DeviceState<'a>,
}

impl<'a> Host<'a> {
    fn new(device: DeviceState<'a>) -> Self {
        Self {
            endpoint: ControlEndpoint::default(),
            device,
        }
    }

    fn transfer(&mut self, raw: [u8; 8]) -> Result<Vec<Event>, TransferStage> {
        self.endpoint.receive_setup(&raw).unwrap();
        let mut recorder = Recorder::default();
        for stage in [TransferStage::Setup, TransferStage::Data, TransferStage::Status] {
            let status = self
                .endpoint
                .handle_standard_request(&mut self.device, &mut recorder, stage);
            if status == RequestStatus::Stall {
                return Err(stage);
            }
        }
        self.device.acknowledge_status();
        Ok(recorder.events)
    }

    fn get_descriptor(&mut self, descriptor_type: DescriptorType, index: u8, length: u16) -> Vec<u8> {
        let events = self
            .transfer(get_descriptor(descriptor_type, index, length))
            .unwrap();
        match events.as_slice() {
            [Event::Block(Direction::In, data), Event::Ack(Direction::Out)] => data.clone(),
            other => panic!("unexpected events {other:?}"),
        }
    }
}

fn get_descriptor(descriptor_type: DescriptorType, index: u8, length: u16) -> [u8; 8] {
    let [length_l, length_h] = length.to_le_bytes();
    [
        0x80,
        StandardRequest::GetDescriptor as u8,
        index,
        descriptor_type as u8,
        0,
        0,
        length_l,
        length_h,
    ]
}

fn set_address(address: u8) -> [u8; 8] {
    [0x00, StandardRequest::SetAddress as u8, address, 0, 0, 0, 0, 0]
}

fn set_configuration(value: u8) -> [u8; 8] {
    [0x00, StandardRequest::SetConfiguration as u8, value, 0, 0, 0, 0, 0]
}

fn get_configuration() -> [u8; 8] {
    [0x80, StandardRequest::GetConfiguration as u8, 0, 0, 0, 0, 1, 0]
}

/// Vendor bulk interface plus a CDC-ACM function, at both speeds.
fn composite_catalog() -> Catalog {
    let acm = AcmFunction::new(1, 2);
    let configuration = |packet_size| {
        ConfigurationBuilder::new(1)
            .max_power(100)
            .interface(
                InterfaceBuilder::new(0)
                    .string_index(4)
                    .endpoint(
                        EndpointBuilder::new()
                            .address_num(1)
                            .direction(Direction::In)
                            .max_packet_size(packet_size)
                            .build(),
                    )
                    .endpoint(
                        EndpointBuilder::new()
                            .address_num(1)
                            .direction(Direction::Out)
                            .max_packet_size(packet_size)
                            .build(),
                    ),
            )
            .interface(
                InterfaceBuilder::from_descriptor(acm.control_interface_descriptor())
                    .association(acm.association())
                    .extra(&acm.functional_descriptors().unwrap())
                    .endpoint(
                        EndpointBuilder::new()
                            .address_num(2)
                            .direction(Direction::In)
                            .transfer_type(TransferType::Interrupt)
                            .max_packet_size(16)
                            .interval(8)
                            .build(),
                    ),
            )
            .interface(
                InterfaceBuilder::from_descriptor(acm.data_interface_descriptor())
                    .endpoint(
                        EndpointBuilder::new()
                            .address_num(3)
                            .direction(Direction::In)
                            .max_packet_size(packet_size)
                            .build(),
                    )
                    .endpoint(
                        EndpointBuilder::new()
                            .address_num(3)
                            .direction(Direction::Out)
                            .max_packet_size(packet_size)
                            .build(),
                    ),
            )
            .build()
            .unwrap()
    };

    CatalogBuilder::new(0x1209, 0x0001)
        .class(DeviceClass::Miscellaneous)
        .subclass(0x02)
        .protocol(0x01)
        .supported_langs(vec![LangId::EnglishUnitedStates, LangId::German])
        .manufacturer("Example Labs")
        .product("Composite Probe")
        .serial("000000000001")
        .strings(vec!["Trace"])
        .device_qualifier()
        .configuration(Speed::Full, configuration(64))
        .configuration(Speed::High, configuration(512))
        .build()
        .unwrap()
}

/// Split a configuration response into (type, length) per record.
fn records(data: &[u8]) -> Vec<(u8, usize)> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let length = data[offset] as usize;
        assert!(length >= 2, "zero length record at {offset}");
        out.push((data[offset + 1], length));
        offset += length;
    }
    assert_eq!(offset, data.len());
    out
}

#[test]
fn enumerates_composite_device() {
    let catalog = composite_catalog();
    let changes = Rc::new(RefCell::new(Vec::new()));
    let seen = changes.clone();
    let listener = ConfigurationChanged::register(move |device: &DeviceState| {
        let endpoints = device
            .configuration()
            .map_or(0, |config| config.endpoints().count());
        seen.borrow_mut().push((device.configuration_number(), endpoints));
    });
    let mut device = DeviceState::with_listener(&catalog, Speed::Full, listener);
    device.bus_reset(Speed::High);
    let mut host = Host::new(device);

    let device_desc = host.get_descriptor(DescriptorType::Device, 0, 64);
    assert_eq!(device_desc.len(), 18);
    assert_eq!(&device_desc[8..12], &[0x09, 0x12, 0x01, 0x00]);
    assert_eq!(device_desc[17], 1);

    let events = host.transfer(set_address(11)).unwrap();
    assert_eq!(events, vec![Event::Ack(Direction::In)]);
    assert_eq!(host.device.address().current(), 11);

    let qualifier = host.get_descriptor(DescriptorType::DeviceQualifier, 0, 10);
    assert_eq!(qualifier.len(), 10);
    assert_eq!(qualifier[1], 0x06);

    let header = host.get_descriptor(DescriptorType::Configuration, 0, 9);
    assert_eq!(header.len(), 9);
    let total = u16::from_le_bytes([header[2], header[3]]);
    // 9 + (9+7+7) + (8+9+19+7) + (9+7+7)
    assert_eq!(total, 98);
    assert_eq!(header[4], 3);

    let config = host.get_descriptor(DescriptorType::Configuration, 0, total);
    assert_eq!(config.len(), 98);
    assert_eq!(&config[..9], header.as_slice());
    let types: Vec<u8> = records(&config).into_iter().map(|(t, _)| t).collect();
    assert_eq!(
        types,
        vec![2, 4, 5, 5, 11, 4, 0x24, 0x24, 0x24, 0x24, 5, 4, 5, 5]
    );

    let other = host.get_descriptor(DescriptorType::OtherSpeedConfiguration, 0, 0xffff);
    assert_eq!(other.len(), 98);
    assert_eq!(other[1], 7);
    // first bulk endpoint at full speed
    assert_eq!(&other[22..24], &[64, 0]);

    let languages = host.get_descriptor(DescriptorType::String, 0, 0xff);
    assert_eq!(languages, vec![6, 3, 0x09, 0x04, 0x07, 0x04]);

    let product = host.get_descriptor(DescriptorType::String, device_desc[15], 0xff);
    let text: String = product[2..]
        .chunks_exact(2)
        .map(|unit| char::from(unit[0]))
        .collect();
    assert_eq!(text, "Composite Probe");
    assert_eq!(product[0] as usize, product.len());

    assert_eq!(
        host.transfer(get_descriptor(DescriptorType::String, 5, 0xff)),
        Err(TransferStage::Setup)
    );

    let events = host.transfer(get_configuration()).unwrap();
    assert_eq!(
        events,
        vec![Event::Block(Direction::In, vec![0]), Event::Ack(Direction::Out)]
    );

    assert_eq!(host.transfer(set_configuration(2)), Err(TransferStage::Setup));
    let events = host.transfer(set_configuration(1)).unwrap();
    assert_eq!(events, vec![Event::Ack(Direction::In)]);
    let events = host.transfer(get_configuration()).unwrap();
    assert_eq!(events[0], Event::Block(Direction::In, vec![1]));

    let bulk = host.device.endpoint_descriptor(0x83).unwrap();
    assert_eq!(bulk.max_packet_size(), 512);
    let notify = host.device.endpoint_descriptor(0x82).unwrap();
    assert_eq!(notify.transfer_type(), TransferType::Interrupt);
    assert!(host.device.endpoint_descriptor(0x84).is_none());

    assert_eq!(*changes.borrow(), vec![(1, 5)]);
}

#[test]
fn deconfigure_and_bus_reset() {
    let catalog = composite_catalog();
    let mut host = Host::new(DeviceState::new(&catalog, Speed::Full));

    host.transfer(set_address(4)).unwrap();
    host.transfer(set_configuration(1)).unwrap();
    assert_eq!(
        host.device.endpoint_descriptor(0x81).unwrap().max_packet_size(),
        64
    );

    host.transfer(set_configuration(0)).unwrap();
    assert!(!host.device.is_configured());
    assert_eq!(host.device.address().current(), 0);

    host.transfer(set_address(6)).unwrap();
    host.transfer(set_configuration(1)).unwrap();
    host.device.bus_reset(Speed::Full);
    assert_eq!(host.device.address().current(), 0);
    assert_eq!(host.device.configuration_number(), 0);
}

#[test]
fn address_changes_only_after_status_stage() {
    let catalog = composite_catalog();
    let mut device = DeviceState::new(&catalog, Speed::High);
    let mut endpoint = ControlEndpoint::default();
    let mut recorder = Recorder::default();

    endpoint.receive_setup(&set_address(21)).unwrap();
    for stage in [TransferStage::Setup, TransferStage::Data, TransferStage::Status] {
        assert_eq!(
            endpoint.handle_standard_request(&mut device, &mut recorder, stage),
            RequestStatus::Ok
        );
        assert_eq!(device.address().current(), 0);
    }
    assert_eq!(device.acknowledge_status(), Some(21));
    assert_eq!(device.address().current(), 21);
}

#[test]
fn unsupported_standard_requests_stall() {
    let catalog = composite_catalog();
    let mut host = Host::new(DeviceState::new(&catalog, Speed::High));
    for request in [
        StandardRequest::GetStatus,
        StandardRequest::ClearFeature,
        StandardRequest::SetFeature,
        StandardRequest::SetDescriptor,
        StandardRequest::GetInterface,
        StandardRequest::SetInterface,
        StandardRequest::SynchFrame,
    ] {
        let raw = [0x80, request as u8, 0, 0, 0, 0, 2, 0];
        assert_eq!(host.transfer(raw), Err(TransferStage::Setup), "{request:?}");
    }
    for descriptor_type in [DescriptorType::Interface, DescriptorType::Endpoint] {
        assert_eq!(
            host.transfer(get_descriptor(descriptor_type, 0, 64)),
            Err(TransferStage::Setup)
        );
    }
}

#[test]
fn small_control_buffer_truncates_configuration() {
    let catalog = composite_catalog();
    let mut device = DeviceState::new(&catalog, Speed::High);
    let mut endpoint = ControlEndpoint::new(64);
    let mut recorder = Recorder::default();

    endpoint
        .receive_setup(&get_descriptor(DescriptorType::Configuration, 0, 0xff))
        .unwrap();
    let status = endpoint.handle_standard_request(&mut device, &mut recorder, TransferStage::Setup);
    assert_eq!(status, RequestStatus::Ok);
    let Event::Block(Direction::In, data) = &recorder.events[0] else {
        panic!("expected IN block, got {:?}", recorder.events);
    };
    assert_eq!(data.len(), 64);
    assert_eq!(u16::from_le_bytes([data[2], data[3]]), 98);
}
