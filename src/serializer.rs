//! Flattening of descriptor trees into the bounded control buffer.

use std::{error::Error, fmt};

use crate::{
    catalog::{Configuration, MAX_STRING_CHARS},
    usb::{DescriptorType, TOTAL_LENGTH_OFFSET},
};

/// What to do when a configuration does not fit the control buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncationPolicy {
    /// Copy as much as fits, but still advertise the full logical length in
    /// wTotalLength.
    #[default]
    Truncate,
    /// Refuse to serialize, the request stalls.
    Reject,
}

/// Outcome of a configuration serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Serialized {
    /// Bytes actually copied into the buffer.
    pub written: usize,
    /// Sum of every record length, regardless of buffer capacity.
    pub total_length: usize,
}

impl Serialized {
    pub fn is_truncated(&self) -> bool {
        self.written < self.total_length
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeError {
    CapacityExceeded { total_length: usize, capacity: usize },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SerializeError::CapacityExceeded {
                total_length,
                capacity,
            } => write!(
                f,
                "configuration of {total_length} bytes exceeds buffer capacity {capacity}"
            ),
        }
    }
}

impl Error for SerializeError {}

/// Copies records into a fixed buffer. Once the buffer is full, records are
/// still counted towards the logical total but no longer copied.
struct Writer<'a> {
    buf: &'a mut [u8],
    written: usize,
    total: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            written: 0,
            total: 0,
        }
    }

    fn copy(&mut self, record: &[u8]) {
        let count = record.len().min(self.buf.len() - self.written);
        self.buf[self.written..self.written + count].copy_from_slice(&record[..count]);
        self.written += count;
        self.total += record.len();
    }
}

/// Flatten `config` into `buf` in wire order: the configuration header, then
/// for each interface its association descriptor (if any) followed by every
/// alternate setting's interface descriptor, extra bytes and endpoints.
///
/// wTotalLength in the copied header is patched with the logical total, and
/// bDescriptorType with `descriptor_type` so the same tree can answer
/// OTHER_SPEED_CONFIGURATION requests.
pub fn serialize_configuration(
    config: &Configuration,
    descriptor_type: DescriptorType,
    buf: &mut [u8],
    policy: TruncationPolicy,
) -> Result<Serialized, SerializeError> {
    if policy == TruncationPolicy::Reject {
        let total_length = config.total_length();
        if total_length > buf.len() {
            return Err(SerializeError::CapacityExceeded {
                total_length,
                capacity: buf.len(),
            });
        }
    }

    let mut writer = Writer::new(buf);
    writer.copy(config.header.as_bytes());
    for iface in config.interfaces.iter() {
        if let Some(association) = iface.association.as_ref() {
            writer.copy(association.as_bytes());
        }
        for setting in iface.settings.iter() {
            writer.copy(setting.descriptor.as_bytes());
            writer.copy(&setting.extra);
            for endpoint in setting.endpoints.iter() {
                writer.copy(endpoint.as_bytes());
            }
        }
    }

    let Writer { buf, written, total } = writer;
    let header = &mut buf[..written];
    if let Some(slot) = header.get_mut(1) {
        *slot = descriptor_type as u8;
    }
    // Catalog construction bounds the total to 16 bits
    let total_field = (total.min(u16::MAX as usize) as u16).to_le_bytes();
    for (i, byte) in total_field.into_iter().enumerate() {
        if let Some(slot) = header.get_mut(TOTAL_LENGTH_OFFSET + i) {
            *slot = byte;
        }
    }

    log::trace!("Serialized configuration: {written} of {total} bytes");
    Ok(Serialized {
        written,
        total_length: total,
    })
}

/// Encode single-byte `text` as a string descriptor in `buf` and return its
/// length. Characters that do not fit are dropped whole; the length byte
/// always matches the bytes written.
pub fn serialize_string(text: &str, buf: &mut [u8]) -> usize {
    if buf.len() < 2 {
        return 0;
    }
    let max_chars = ((buf.len() - 2) / 2).min(MAX_STRING_CHARS);
    let chars = &text.as_bytes()[..text.len().min(max_chars)];

    let length = 2 + 2 * chars.len();
    buf[0] = length as u8;
    buf[1] = DescriptorType::String as u8;
    for (unit, &c) in buf[2..length].chunks_exact_mut(2).zip(chars) {
        unit.copy_from_slice(&u16::from(c).to_le_bytes());
    }
    length
}
