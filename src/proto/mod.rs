pub(crate) mod frame;
pub(crate) mod gap;
pub(crate) mod mesh;

pub use self::frame::{Frame, FrameCodec, FrameReadError};
pub use self::gap::{
    Connect, ControllerInfo, DeviceConnected, DeviceDisconnected, DeviceFound, Disconnect,
    DiscoverableMode, DiscoveryFlags, GapEvent, Pair, PasskeyDisplay, PasskeyEntry,
    ReadCharacteristic, ReadControllerInfo, ReadValue, SetConnectable, SetDiscoverable, Settings,
    SignedWrite, StartAdvertising, StartDiscovery, StopAdvertising, StopDiscovery, Unpair,
};
pub use self::mesh::MeshInit;

use strum_macros::{Display as StrumDisplay, EnumIter, FromRepr};
use thiserror::Error;

use crate::addr::{AddrType, DeviceAddr};

/// Controller index carried in every frame header. The bridge always talks
/// to the first controller of the IUT.
pub const CONTROLLER_INDEX: u8 = 0x00;

/// Response opcode reserved for command rejection.
pub const STATUS_OPCODE: u8 = 0x00;

/// Opcodes with this bit set are unsolicited events.
pub const EVENT_BIT: u8 = 0x80;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The buffer has fewer than the mandatory 5 header bytes.
    #[error("frame is too short: expected at least 5 bytes, got {actual}")]
    HeaderTooShort { actual: usize },
    /// The declared payload length does not match the bytes that follow.
    #[error("frame length mismatch: declared {declared} payload bytes but {actual} follow")]
    LengthMismatch { declared: usize, actual: usize },
    /// The payload is too large to fit in a 16-bit length field.
    #[error("payload is too large: {payload_len} bytes exceeds max {max_payload_len}")]
    PayloadTooLarge {
        payload_len: usize,
        max_payload_len: usize,
    },
    /// The service id byte does not name a known service.
    #[error("unknown service id 0x{id:02X}")]
    UnknownService { id: u8 },
    /// A typed payload ended before the named field.
    #[error("payload truncated reading `{field}`")]
    Truncated { field: &'static str },
    /// A typed payload carried bytes past its last field.
    #[error("{count} unexpected trailing bytes in payload")]
    TrailingBytes { count: usize },
    /// The address-type tag is neither public nor random.
    #[error("unknown address type tag 0x{tag:02X}")]
    UnknownAddrType { tag: u8 },
}

/// Services multiplexed over one control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Service {
    Core = 0x00,
    Gap = 0x01,
    Gatt = 0x02,
    Mesh = 0x04,
}

impl Service {
    /// Looks up a service by its wire id.
    ///
    /// ```
    /// use certbridge::Service;
    ///
    /// assert_eq!(Some(Service::Gap), Service::from_id(0x01));
    /// assert_eq!(None, Service::from_id(0x03));
    /// ```
    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        Self::from_repr(id)
    }

    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }
}

/// Command completion codes carried by status responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Status {
    Success = 0x00,
    Failed = 0x01,
    UnknownCommand = 0x02,
    NotReady = 0x03,
}

/// Core service command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, FromRepr)]
#[repr(u8)]
pub enum CoreOp {
    RegisterService = 0x03,
    UnregisterService = 0x04,
}

/// Core service event opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, FromRepr)]
#[repr(u8)]
pub enum CoreEvent {
    IutReady = 0x80,
}

/// GAP service command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, FromRepr)]
#[repr(u8)]
pub enum GapOp {
    ReadControllerInfo = 0x02,
    SetConnectable = 0x05,
    SetDiscoverable = 0x07,
    StartAdvertising = 0x09,
    StopAdvertising = 0x0A,
    StartDiscovery = 0x0B,
    StopDiscovery = 0x0C,
    Connect = 0x0D,
    Disconnect = 0x0E,
    Pair = 0x10,
    Unpair = 0x11,
    PasskeyEntry = 0x12,
}

/// GAP service event opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, FromRepr)]
#[repr(u8)]
pub enum GapEventId {
    DeviceFound = 0x81,
    Connected = 0x82,
    Disconnected = 0x83,
    PasskeyDisplay = 0x84,
}

/// GATT service command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, FromRepr)]
#[repr(u8)]
pub enum GattOp {
    Read = 0x11,
    SignedWrite = 0x13,
}

/// Mesh service command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, FromRepr)]
#[repr(u8)]
pub enum MeshOp {
    Init = 0x02,
}

/// An event opcode bound to its service, usable as a subscription key.
pub trait EventKind: Copy {
    const SERVICE: Service;

    fn opcode(self) -> u8;
}

impl EventKind for CoreEvent {
    const SERVICE: Service = Service::Core;

    fn opcode(self) -> u8 {
        self as u8
    }
}

impl EventKind for GapEventId {
    const SERVICE: Service = Service::Gap;

    fn opcode(self) -> u8 {
        self as u8
    }
}

/// A typed command the bridge can issue to the IUT.
pub trait Command {
    /// Service the command belongs to.
    const SERVICE: Service;

    /// Typed decode of the response payload.
    type Reply: Reply;

    fn opcode(&self) -> u8;

    fn payload(&self) -> Vec<u8>;
}

/// A typed response payload.
pub trait Reply: Sized {
    /// Decodes the response payload.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when the payload does not match the expected
    /// shape.
    fn decode(payload: &[u8]) -> Result<Self, WireError>;
}

/// The empty response most state-changing commands confirm with.
impl Reply for () {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes {
                count: payload.len(),
            })
        }
    }
}

/// Announces that the bridge will drive the given service on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterService {
    pub service: Service,
}

impl Command for RegisterService {
    const SERVICE: Service = Service::Core;
    type Reply = ();

    fn opcode(&self) -> u8 {
        CoreOp::RegisterService as u8
    }

    fn payload(&self) -> Vec<u8> {
        vec![self.service.id()]
    }
}

/// Withdraws a previously registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisterService {
    pub service: Service,
}

impl Command for UnregisterService {
    const SERVICE: Service = Service::Core;
    type Reply = ();

    fn opcode(&self) -> u8 {
        CoreOp::UnregisterService as u8
    }

    fn payload(&self) -> Vec<u8> {
        vec![self.service.id()]
    }
}

/// Forward-only cursor over a payload, reporting which field was truncated.
#[derive(Debug)]
pub(crate) struct PayloadReader<'a> {
    bytes: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn u8(&mut self, field: &'static str) -> Result<u8, WireError> {
        let bytes = self.take(1, field)?;
        Ok(bytes[0])
    }

    pub(crate) fn i8(&mut self, field: &'static str) -> Result<i8, WireError> {
        Ok(self.u8(field)? as i8)
    }

    pub(crate) fn u16_le(&mut self, field: &'static str) -> Result<u16, WireError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32_le(&mut self, field: &'static str) -> Result<u32, WireError> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn addr(&mut self, field: &'static str) -> Result<DeviceAddr, WireError> {
        let bytes = self.take(6, field)?;
        let mut wire = [0u8; 6];
        wire.copy_from_slice(bytes);
        Ok(DeviceAddr::from_wire(wire))
    }

    pub(crate) fn addr_type(&mut self, field: &'static str) -> Result<AddrType, WireError> {
        let tag = self.u8(field)?;
        AddrType::from_wire(tag).ok_or(WireError::UnknownAddrType { tag })
    }

    pub(crate) fn take(
        &mut self,
        count: usize,
        field: &'static str,
    ) -> Result<&'a [u8], WireError> {
        if self.bytes.len() < count {
            return Err(WireError::Truncated { field });
        }
        let (taken, rest) = self.bytes.split_at(count);
        self.bytes = rest;
        Ok(taken)
    }

    /// Asserts the payload is fully consumed.
    pub(crate) fn finish(self) -> Result<(), WireError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes {
                count: self.bytes.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    use super::*;

    #[rstest]
    #[case(Service::Core, 0x00)]
    #[case(Service::Gap, 0x01)]
    #[case(Service::Gatt, 0x02)]
    #[case(Service::Mesh, 0x04)]
    fn service_ids_round_trip(#[case] service: Service, #[case] id: u8) {
        assert_eq!(id, service.id());
        assert_eq!(Some(service), Service::from_id(id));
    }

    #[test]
    fn every_event_opcode_has_the_event_bit() {
        for event in CoreEvent::iter() {
            assert!(event.opcode() & EVENT_BIT != 0, "{event:?}");
        }
        for event in GapEventId::iter() {
            assert!(event.opcode() & EVENT_BIT != 0, "{event:?}");
        }
    }

    #[test]
    fn no_command_opcode_has_the_event_bit() {
        for op in CoreOp::iter() {
            assert!((op as u8) & EVENT_BIT == 0, "{op:?}");
        }
        for op in GapOp::iter() {
            assert!((op as u8) & EVENT_BIT == 0, "{op:?}");
        }
        for op in GattOp::iter() {
            assert!((op as u8) & EVENT_BIT == 0, "{op:?}");
        }
        for op in MeshOp::iter() {
            assert!((op as u8) & EVENT_BIT == 0, "{op:?}");
        }
    }

    #[test]
    fn payload_reader_reports_truncated_field() {
        let mut reader = PayloadReader::new(&[0x01]);
        let result = reader.u16_le("interval");
        assert_matches!(result, Err(WireError::Truncated { field: "interval" }));
    }

    #[test]
    fn payload_reader_reads_little_endian_fields() {
        let mut reader = PayloadReader::new(&[0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(0x1234, reader.u16_le("first").expect("two bytes remain"));
        assert_eq!(
            0x1234_5678,
            reader.u32_le("second").expect("four bytes remain")
        );
        reader.finish().expect("payload should be fully consumed");
    }

    #[test]
    fn payload_reader_rejects_trailing_bytes() {
        let mut reader = PayloadReader::new(&[0x01, 0x02]);
        let _ = reader.u8("only").expect("one byte remains");
        assert_matches!(reader.finish(), Err(WireError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn empty_reply_rejects_payload_bytes() {
        let result = <() as Reply>::decode(&[0x00]);
        assert_matches!(result, Err(WireError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn register_service_carries_the_target_service_id() {
        let command = RegisterService {
            service: Service::Gap,
        };
        assert_eq!(Service::Core, RegisterService::SERVICE);
        assert_eq!(CoreOp::RegisterService as u8, command.opcode());
        assert_eq!(vec![0x01], command.payload());
    }

    #[test]
    fn unregister_service_carries_the_target_service_id() {
        let command = UnregisterService {
            service: Service::Mesh,
        };
        assert_eq!(CoreOp::UnregisterService as u8, command.opcode());
        assert_eq!(vec![0x04], command.payload());
    }
}
