//! Device-side handling of USB standard requests on the default control
//! pipe: a descriptor catalog, the serializer that flattens it into the
//! control buffer, the address/configuration state machine and the request
//! dispatcher driven by the peripheral layer.

pub mod catalog;
pub mod device;
pub mod request;
pub mod serializer;
pub mod usb;
