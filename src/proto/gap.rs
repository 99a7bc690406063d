//! Typed GAP and GATT commands, responses and events.
//!
//! Encoders produce exactly the payload bytes behind the frame header;
//! decoders consume the whole payload and reject trailing bytes.

use std::fmt::{self, Display, Formatter};

use crate::addr::{DeviceAddr, PeerAddr};

use super::{Command, GapEventId, GapOp, GattOp, PayloadReader, Reply, Service, WireError};

/// Controller settings bitmask echoed by most GAP commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Settings(u32);

impl Settings {
    pub const POWERED: Self = Self(1 << 0);
    pub const CONNECTABLE: Self = Self(1 << 1);
    pub const DISCOVERABLE: Self = Self(1 << 3);
    pub const BONDABLE: Self = Self(1 << 4);
    pub const LOW_ENERGY: Self = Self(1 << 9);
    pub const ADVERTISING: Self = Self(1 << 10);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl Display for Settings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl Reply for Settings {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let bits = reader.u32_le("current_settings")?;
        reader.finish()?;
        Ok(Self(bits))
    }
}

/// Discovery scan parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryFlags {
    pub low_energy: bool,
    pub limited: bool,
    pub active: bool,
    pub observe: bool,
}

impl DiscoveryFlags {
    /// Active LE general discovery.
    #[must_use]
    pub const fn active_le() -> Self {
        Self {
            low_energy: true,
            limited: false,
            active: true,
            observe: false,
        }
    }

    /// Passive LE general discovery.
    #[must_use]
    pub const fn passive_le() -> Self {
        Self {
            low_energy: true,
            limited: false,
            active: false,
            observe: false,
        }
    }

    /// Passive observation, reporting non-discoverable advertisers too.
    #[must_use]
    pub const fn observing() -> Self {
        Self {
            low_energy: true,
            limited: false,
            active: false,
            observe: true,
        }
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        (self.low_energy as u8)
            | (self.limited as u8) << 2
            | (self.active as u8) << 3
            | (self.observe as u8) << 4
    }
}

/// Discoverable mode requested from the IUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoverableMode {
    Off = 0x00,
    General = 0x01,
    Limited = 0x02,
}

/// Reads the controller's identity and settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadControllerInfo;

impl Command for ReadControllerInfo {
    const SERVICE: Service = Service::Gap;
    type Reply = ControllerInfo;

    fn opcode(&self) -> u8 {
        GapOp::ReadControllerInfo as u8
    }

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Controller identity reported by the IUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    pub addr: DeviceAddr,
    pub supported_settings: Settings,
    pub current_settings: Settings,
    pub name: String,
}

impl ControllerInfo {
    /// Encodes the response payload (used when answering for a scripted IUT).
    ///
    /// # Errors
    ///
    /// Returns an error when the name exceeds its one-byte length prefix.
    pub fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let name = self.name.as_bytes();
        let name_len = u8::try_from(name.len()).map_err(|_overflow| WireError::PayloadTooLarge {
            payload_len: name.len(),
            max_payload_len: usize::from(u8::MAX),
        })?;

        let mut payload = Vec::with_capacity(15 + name.len());
        payload.extend_from_slice(&self.addr.wire_bytes());
        payload.extend_from_slice(&self.supported_settings.bits().to_le_bytes());
        payload.extend_from_slice(&self.current_settings.bits().to_le_bytes());
        payload.push(name_len);
        payload.extend_from_slice(name);
        Ok(payload)
    }
}

impl Reply for ControllerInfo {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let addr = reader.addr("address")?;
        let supported_settings = Settings(reader.u32_le("supported_settings")?);
        let current_settings = Settings(reader.u32_le("current_settings")?);
        let name_len = usize::from(reader.u8("name_len")?);
        let name = String::from_utf8_lossy(reader.take(name_len, "name")?).into_owned();
        reader.finish()?;
        Ok(Self {
            addr,
            supported_settings,
            current_settings,
            name,
        })
    }
}

/// Enables or disables connectable mode.
#[derive(Debug, Clone, Copy)]
pub struct SetConnectable {
    pub enable: bool,
}

impl Command for SetConnectable {
    const SERVICE: Service = Service::Gap;
    type Reply = Settings;

    fn opcode(&self) -> u8 {
        GapOp::SetConnectable as u8
    }

    fn payload(&self) -> Vec<u8> {
        vec![u8::from(self.enable)]
    }
}

/// Selects the discoverable mode.
#[derive(Debug, Clone, Copy)]
pub struct SetDiscoverable {
    pub mode: DiscoverableMode,
}

impl Command for SetDiscoverable {
    const SERVICE: Service = Service::Gap;
    type Reply = Settings;

    fn opcode(&self) -> u8 {
        GapOp::SetDiscoverable as u8
    }

    fn payload(&self) -> Vec<u8> {
        vec![self.mode as u8]
    }
}

/// Starts advertising with pre-rendered AD and scan-response blobs.
///
/// The blobs carry on-air `length | type | value` entries; the state model
/// renders and budget-checks them before this command is built.
#[derive(Debug, Clone)]
pub struct StartAdvertising {
    adv_data: Vec<u8>,
    scan_rsp: Vec<u8>,
}

impl StartAdvertising {
    /// Wraps rendered advertising blobs.
    ///
    /// # Errors
    ///
    /// Returns an error when either blob exceeds its one-byte length prefix.
    pub fn new(adv_data: Vec<u8>, scan_rsp: Vec<u8>) -> Result<Self, WireError> {
        for blob in [&adv_data, &scan_rsp] {
            if u8::try_from(blob.len()).is_err() {
                return Err(WireError::PayloadTooLarge {
                    payload_len: blob.len(),
                    max_payload_len: usize::from(u8::MAX),
                });
            }
        }
        Ok(Self { adv_data, scan_rsp })
    }
}

impl Command for StartAdvertising {
    const SERVICE: Service = Service::Gap;
    type Reply = Settings;

    fn opcode(&self) -> u8 {
        GapOp::StartAdvertising as u8
    }

    #[allow(clippy::cast_possible_truncation)]
    fn payload(&self) -> Vec<u8> {
        // Lengths were validated in `new`.
        let mut payload = Vec::with_capacity(2 + self.adv_data.len() + self.scan_rsp.len());
        payload.push(self.adv_data.len() as u8);
        payload.push(self.scan_rsp.len() as u8);
        payload.extend_from_slice(&self.adv_data);
        payload.extend_from_slice(&self.scan_rsp);
        payload
    }
}

/// Stops advertising.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopAdvertising;

impl Command for StopAdvertising {
    const SERVICE: Service = Service::Gap;
    type Reply = Settings;

    fn opcode(&self) -> u8 {
        GapOp::StopAdvertising as u8
    }

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Starts device discovery.
#[derive(Debug, Clone, Copy)]
pub struct StartDiscovery {
    pub flags: DiscoveryFlags,
}

impl Command for StartDiscovery {
    const SERVICE: Service = Service::Gap;
    type Reply = ();

    fn opcode(&self) -> u8 {
        GapOp::StartDiscovery as u8
    }

    fn payload(&self) -> Vec<u8> {
        vec![self.flags.bits()]
    }
}

/// Stops device discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopDiscovery;

impl Command for StopDiscovery {
    const SERVICE: Service = Service::Gap;
    type Reply = ();

    fn opcode(&self) -> u8 {
        GapOp::StopDiscovery as u8
    }

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }
}

fn peer_payload(peer: PeerAddr) -> Vec<u8> {
    let mut payload = Vec::with_capacity(7);
    payload.push(peer.addr_type as u8);
    payload.extend_from_slice(&peer.addr.wire_bytes());
    payload
}

macro_rules! peer_command {
    ($(#[$doc:meta])* $name:ident, $op:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            pub peer: PeerAddr,
        }

        impl Command for $name {
            const SERVICE: Service = Service::Gap;
            type Reply = ();

            fn opcode(&self) -> u8 {
                $op as u8
            }

            fn payload(&self) -> Vec<u8> {
                peer_payload(self.peer)
            }
        }
    };
}

peer_command!(
    /// Initiates a connection to the peer.
    Connect,
    GapOp::Connect
);
peer_command!(
    /// Tears down the connection to the peer.
    Disconnect,
    GapOp::Disconnect
);
peer_command!(
    /// Starts pairing with the peer.
    Pair,
    GapOp::Pair
);
peer_command!(
    /// Removes the peer's bond.
    Unpair,
    GapOp::Unpair
);

/// Replies to a passkey request with the digits the tester displayed.
#[derive(Debug, Clone, Copy)]
pub struct PasskeyEntry {
    pub peer: PeerAddr,
    pub passkey: u32,
}

impl Command for PasskeyEntry {
    const SERVICE: Service = Service::Gap;
    type Reply = ();

    fn opcode(&self) -> u8 {
        GapOp::PasskeyEntry as u8
    }

    fn payload(&self) -> Vec<u8> {
        let mut payload = peer_payload(self.peer);
        payload.extend_from_slice(&self.passkey.to_le_bytes());
        payload
    }
}

/// Reads a characteristic value by attribute handle.
#[derive(Debug, Clone, Copy)]
pub struct ReadCharacteristic {
    pub peer: PeerAddr,
    pub handle: u16,
}

impl Command for ReadCharacteristic {
    const SERVICE: Service = Service::Gatt;
    type Reply = ReadValue;

    fn opcode(&self) -> u8 {
        GattOp::Read as u8
    }

    fn payload(&self) -> Vec<u8> {
        let mut payload = peer_payload(self.peer);
        payload.extend_from_slice(&self.handle.to_le_bytes());
        payload
    }
}

/// Attribute read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadValue {
    /// ATT error code, zero on success.
    pub att_response: u8,
    pub value: Vec<u8>,
}

impl Reply for ReadValue {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let att_response = reader.u8("att_response")?;
        let value_len = usize::from(reader.u16_le("value_len")?);
        let value = reader.take(value_len, "value")?.to_vec();
        reader.finish()?;
        Ok(Self {
            att_response,
            value,
        })
    }
}

/// Writes a value with an authentication signature, without a response.
#[derive(Debug, Clone)]
pub struct SignedWrite {
    peer: PeerAddr,
    handle: u16,
    value: Vec<u8>,
}

impl SignedWrite {
    /// # Errors
    ///
    /// Returns an error when the value exceeds its two-byte length prefix.
    pub fn new(peer: PeerAddr, handle: u16, value: Vec<u8>) -> Result<Self, WireError> {
        if u16::try_from(value.len()).is_err() {
            return Err(WireError::PayloadTooLarge {
                payload_len: value.len(),
                max_payload_len: usize::from(u16::MAX),
            });
        }
        Ok(Self {
            peer,
            handle,
            value,
        })
    }
}

impl Command for SignedWrite {
    const SERVICE: Service = Service::Gatt;
    type Reply = ();

    fn opcode(&self) -> u8 {
        GattOp::SignedWrite as u8
    }

    #[allow(clippy::cast_possible_truncation)]
    fn payload(&self) -> Vec<u8> {
        // Length was validated in `new`.
        let mut payload = peer_payload(self.peer);
        payload.extend_from_slice(&self.handle.to_le_bytes());
        payload.extend_from_slice(&(self.value.len() as u16).to_le_bytes());
        payload.extend_from_slice(&self.value);
        payload
    }
}

/// A peer's advertisement or scan response observed during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFound {
    pub peer: PeerAddr,
    pub rssi: i8,
    /// Report flags: bit 0 RSSI valid, bit 1 advertising data, bit 2 scan
    /// response.
    pub flags: u8,
    pub eir: Vec<u8>,
}

impl DeviceFound {
    /// Decodes the event payload.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] for truncated or oversized payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let addr_type = reader.addr_type("addr_type")?;
        let addr = reader.addr("address")?;
        let rssi = reader.i8("rssi")?;
        let flags = reader.u8("flags")?;
        let eir_len = usize::from(reader.u16_le("eir_len")?);
        let eir = reader.take(eir_len, "eir")?.to_vec();
        reader.finish()?;
        Ok(Self {
            peer: PeerAddr::new(addr_type, addr),
            rssi,
            flags,
            eir,
        })
    }

    /// Encodes the event payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the EIR blob exceeds its two-byte length prefix.
    pub fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let eir_len =
            u16::try_from(self.eir.len()).map_err(|_overflow| WireError::PayloadTooLarge {
                payload_len: self.eir.len(),
                max_payload_len: usize::from(u16::MAX),
            })?;

        let mut payload = Vec::with_capacity(11 + self.eir.len());
        payload.push(self.peer.addr_type as u8);
        payload.extend_from_slice(&self.peer.addr.wire_bytes());
        payload.push(self.rssi as u8);
        payload.push(self.flags);
        payload.extend_from_slice(&eir_len.to_le_bytes());
        payload.extend_from_slice(&self.eir);
        Ok(payload)
    }
}

/// A link to the peer came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConnected {
    pub peer: PeerAddr,
    pub interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

impl DeviceConnected {
    /// # Errors
    ///
    /// Returns a [`WireError`] for truncated or oversized payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let addr_type = reader.addr_type("addr_type")?;
        let addr = reader.addr("address")?;
        let interval = reader.u16_le("interval")?;
        let latency = reader.u16_le("latency")?;
        let supervision_timeout = reader.u16_le("supervision_timeout")?;
        reader.finish()?;
        Ok(Self {
            peer: PeerAddr::new(addr_type, addr),
            interval,
            latency,
            supervision_timeout,
        })
    }

    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut payload = peer_payload(self.peer);
        payload.extend_from_slice(&self.interval.to_le_bytes());
        payload.extend_from_slice(&self.latency.to_le_bytes());
        payload.extend_from_slice(&self.supervision_timeout.to_le_bytes());
        payload
    }
}

/// The link to the peer went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDisconnected {
    pub peer: PeerAddr,
}

impl DeviceDisconnected {
    /// # Errors
    ///
    /// Returns a [`WireError`] for truncated or oversized payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let addr_type = reader.addr_type("addr_type")?;
        let addr = reader.addr("address")?;
        reader.finish()?;
        Ok(Self {
            peer: PeerAddr::new(addr_type, addr),
        })
    }

    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        peer_payload(self.peer)
    }
}

/// The IUT is showing a passkey for the tester to confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasskeyDisplay {
    pub peer: PeerAddr,
    pub passkey: u32,
}

impl PasskeyDisplay {
    /// # Errors
    ///
    /// Returns a [`WireError`] for truncated or oversized payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let addr_type = reader.addr_type("addr_type")?;
        let addr = reader.addr("address")?;
        let passkey = reader.u32_le("passkey")?;
        reader.finish()?;
        Ok(Self {
            peer: PeerAddr::new(addr_type, addr),
            passkey,
        })
    }

    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut payload = peer_payload(self.peer);
        payload.extend_from_slice(&self.passkey.to_le_bytes());
        payload
    }
}

/// Any decoded GAP event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapEvent {
    DeviceFound(DeviceFound),
    Connected(DeviceConnected),
    Disconnected(DeviceDisconnected),
    PasskeyDisplay(PasskeyDisplay),
}

impl GapEvent {
    /// Decodes a GAP event by opcode. Unknown opcodes return `None` so the
    /// caller can skip events this bridge does not model.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when a known opcode carries a malformed
    /// payload.
    pub fn decode(opcode: u8, payload: &[u8]) -> Result<Option<Self>, WireError> {
        let Some(event) = GapEventId::from_repr(opcode) else {
            return Ok(None);
        };
        let decoded = match event {
            GapEventId::DeviceFound => Self::DeviceFound(DeviceFound::decode(payload)?),
            GapEventId::Connected => Self::Connected(DeviceConnected::decode(payload)?),
            GapEventId::Disconnected => Self::Disconnected(DeviceDisconnected::decode(payload)?),
            GapEventId::PasskeyDisplay => Self::PasskeyDisplay(PasskeyDisplay::decode(payload)?),
        };
        Ok(Some(decoded))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::addr::AddrType;

    use super::*;

    fn peer() -> PeerAddr {
        PeerAddr::new(
            AddrType::Public,
            DeviceAddr::new([0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD]),
        )
    }

    #[test]
    fn connect_payload_reverses_address_bytes() {
        let command = Connect { peer: peer() };
        assert_eq!(
            vec![0x00, 0xAD, 0xDE, 0xEF, 0xBE, 0xAD, 0xDE],
            command.payload()
        );
    }

    #[test]
    fn start_advertising_prefixes_both_blob_lengths() {
        let command = StartAdvertising::new(vec![0x02, 0x01, 0x06], vec![0x03, 0x09, 0x41, 0x42])
            .expect("short blobs should wrap");
        assert_eq!(
            vec![0x03, 0x04, 0x02, 0x01, 0x06, 0x03, 0x09, 0x41, 0x42],
            command.payload()
        );
    }

    #[test]
    fn start_advertising_rejects_blob_over_prefix() {
        let result = StartAdvertising::new(vec![0x00; 256], Vec::new());
        assert_matches!(result, Err(WireError::PayloadTooLarge { payload_len: 256, .. }));
    }

    #[rstest]
    #[case(DiscoveryFlags::active_le(), 0b0000_1001)]
    #[case(DiscoveryFlags::passive_le(), 0b0000_0001)]
    #[case(DiscoveryFlags::observing(), 0b0001_0001)]
    fn discovery_flag_bits(#[case] flags: DiscoveryFlags, #[case] expected: u8) {
        assert_eq!(expected, flags.bits());
    }

    #[test]
    fn passkey_entry_appends_little_endian_passkey() {
        let command = PasskeyEntry {
            peer: peer(),
            passkey: 915_210,
        };
        let payload = command.payload();
        assert_eq!(&[0x0A, 0xF7, 0x0D, 0x00], &payload[7..]);
    }

    #[test]
    fn settings_reply_decodes_little_endian_bits() {
        let settings =
            Settings::decode(&[0x02, 0x06, 0x00, 0x00]).expect("four bytes should decode");
        assert!(settings.contains(Settings::CONNECTABLE));
        assert!(settings.contains(Settings::LOW_ENERGY));
        assert!(settings.contains(Settings::ADVERTISING));
        assert!(!settings.contains(Settings::DISCOVERABLE));
    }

    #[test]
    fn controller_info_round_trips() {
        let info = ControllerInfo {
            addr: DeviceAddr::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            supported_settings: Settings::from_bits(0xFFFF),
            current_settings: Settings::CONNECTABLE.with(Settings::LOW_ENERGY),
            name: "iut-0".to_string(),
        };
        let payload = info.encode_payload().expect("short name should encode");
        assert_eq!(info, ControllerInfo::decode(&payload).expect("round trip"));
    }

    #[test]
    fn device_found_round_trips_with_eir() {
        let event = DeviceFound {
            peer: peer(),
            rssi: -42,
            flags: 0b0000_0011,
            eir: vec![0x02, 0x01, 0x06, 0x03, 0xFF, 0xAB, 0xCD],
        };
        let payload = event.encode_payload().expect("short eir should encode");
        assert_eq!(event, DeviceFound::decode(&payload).expect("round trip"));
    }

    #[test]
    fn device_found_rejects_truncated_eir() {
        let event = DeviceFound {
            peer: peer(),
            rssi: -42,
            flags: 0x01,
            eir: vec![0xAA, 0xBB],
        };
        let mut payload = event.encode_payload().expect("short eir should encode");
        payload.pop();
        let result = DeviceFound::decode(&payload);
        assert_matches!(result, Err(WireError::Truncated { field: "eir" }));
    }

    #[test]
    fn gap_event_decode_skips_unknown_opcode() {
        let decoded = GapEvent::decode(0xF0, &[]).expect("unknown opcodes are skipped");
        assert_eq!(None, decoded);
    }

    #[test]
    fn gap_event_decode_maps_connected() {
        let event = DeviceConnected {
            peer: peer(),
            interval: 0x0018,
            latency: 0,
            supervision_timeout: 0x002A,
        };
        let decoded = GapEvent::decode(GapEventId::Connected as u8, &event.encode_payload())
            .expect("well-formed payload should decode");
        assert_matches!(decoded, Some(GapEvent::Connected(inner)) if inner == event);
    }

    #[test]
    fn read_value_decodes_length_prefixed_value() {
        let reply =
            ReadValue::decode(&[0x00, 0x03, 0x00, 0x01, 0x02, 0x03]).expect("should decode");
        assert_eq!(0x00, reply.att_response);
        assert_eq!(vec![0x01, 0x02, 0x03], reply.value);
    }

    #[test]
    fn signed_write_payload_layout() {
        let command = SignedWrite::new(peer(), 0x00CD, vec![0x01]).expect("short value");
        let payload = command.payload();
        assert_eq!(&[0xCD, 0x00, 0x01, 0x00, 0x01], &payload[7..]);
    }
}
