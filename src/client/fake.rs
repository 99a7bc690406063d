use std::str::FromStr;

use bon::Builder;
use thiserror::Error;
use tokio::io::DuplexStream;
use tracing::{debug, trace, warn};

use crate::addr::{AddrError, DeviceAddr, PeerAddr};
use crate::client::transport::duplex_pair;
use crate::proto::{
    ControllerInfo, CoreEvent, CoreOp, DeviceConnected, DeviceDisconnected, DeviceFound, Frame,
    FrameCodec, GapEventId, GapOp, GattOp, MeshOp, PasskeyDisplay, PayloadReader, STATUS_OPCODE,
    Service, Settings, Status, WireError,
};

/// Connection parameters reported by scripted connected events.
const FAKE_CONN_INTERVAL: u16 = 0x0028;
const FAKE_CONN_LATENCY: u16 = 0x0000;
const FAKE_CONN_TIMEOUT: u16 = 0x002A;

/// Errors returned when parsing fake IUT fixtures.
#[derive(Debug, Error, PartialEq)]
pub enum FixtureError {
    #[error("the found-device fixture is empty")]
    EmptyFixture,
    #[error("fixture records need `type|address|rssi|eir-hex` fields")]
    InvalidFieldCount,
    #[error(transparent)]
    Addr(#[from] AddrError),
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("invalid EIR hex payload")]
    InvalidEir(#[from] hex::FromHexError),
}

/// One scripted discovery result.
///
/// Parses from `type|address|rssi|eir-hex`, with `-` standing for an empty
/// EIR blob:
///
/// ```
/// use certbridge::FoundRecord;
///
/// let record: FoundRecord = "public|DEADBEEFDEAD|-42|020106".parse()?;
/// assert_eq!(-42, record.rssi);
/// assert_eq!(vec![0x02, 0x01, 0x06], record.eir);
/// # Ok::<(), certbridge::FixtureError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundRecord {
    pub peer: PeerAddr,
    pub rssi: i8,
    pub eir: Vec<u8>,
}

impl FromStr for FoundRecord {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = value.split('|').map(str::trim).collect();
        let [addr_type, addr, rssi, eir] = fields.as_slice() else {
            return Err(FixtureError::InvalidFieldCount);
        };

        let peer: PeerAddr = format!("{addr_type}|{addr}").parse()?;
        let rssi = rssi.parse::<i8>()?;
        let eir = if *eir == "-" { Vec::new() } else { hex::decode(eir)? };

        Ok(Self { peer, rssi, eir })
    }
}

/// A semicolon-separated list of [`FoundRecord`]s, as passed to
/// `--fake-found`.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Into)]
pub struct FoundFixture {
    records: Vec<FoundRecord>,
}

impl FromStr for FoundFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(FixtureError::EmptyFixture);
        }
        let records = value
            .split(';')
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { records })
    }
}

/// Script for one fake IUT instance.
#[derive(Debug, Clone, Builder)]
pub struct FakeIutConfig {
    /// Controller address reported by read-controller-info.
    #[builder(default = DeviceAddr::new([0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD]))]
    addr: DeviceAddr,
    /// Controller name reported by read-controller-info.
    #[builder(into, default = String::from("fake-iut"))]
    name: String,
    /// Discovery results replayed after every discovery start.
    #[builder(default)]
    found: Vec<FoundRecord>,
    /// Passkey displayed once pairing starts.
    passkey: Option<u32>,
    /// Value served for characteristic reads.
    #[builder(default = vec![0x01])]
    read_value: Vec<u8>,
    /// When set, connects are accepted but never produce a connected event.
    #[builder(default)]
    unreachable: bool,
    /// Commands answered with a `failed` status instead of a response.
    #[builder(default)]
    rejects: Vec<(Service, u8)>,
}

impl Default for FakeIutConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Spawns a scripted IUT double and returns the bridge-side transport end.
///
/// The fake announces IUT-ready, then answers every command frame until the
/// peer closes the stream. It speaks the same octets a real IUT would, so
/// everything above the transport is exercised unchanged.
#[must_use]
pub fn spawn_fake_iut(config: FakeIutConfig) -> DuplexStream {
    let (near, far) = duplex_pair();
    tokio::spawn(serve(far, config));
    near
}

async fn serve(mut stream: DuplexStream, config: FakeIutConfig) {
    let ready = Frame::new(Service::Core, CoreEvent::IutReady as u8, Vec::new());
    if FrameCodec::write_frame(&mut stream, &ready).await.is_err() {
        return;
    }

    let mut current = Settings::POWERED.with(Settings::BONDABLE).with(Settings::LOW_ENERGY);

    loop {
        let frame = match FrameCodec::read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(error) => {
                debug!(%error, "fake IUT stream ended");
                return;
            }
        };
        trace!(service = %frame.service, opcode = frame.opcode, "fake IUT received command");

        for reply in respond(&config, &mut current, &frame) {
            if let Err(error) = FrameCodec::write_frame(&mut stream, &reply).await {
                debug!(%error, "fake IUT failed to write; stopping");
                return;
            }
        }
    }
}

fn respond(config: &FakeIutConfig, current: &mut Settings, frame: &Frame) -> Vec<Frame> {
    if config.rejects.contains(&(frame.service, frame.opcode)) {
        return vec![status(frame, Status::Failed)];
    }

    let echo = |payload: Vec<u8>| Frame::new(frame.service, frame.opcode, payload);
    let settings = |current: Settings| echo(current.bits().to_le_bytes().to_vec());

    match (frame.service, frame.opcode) {
        (Service::Core, op) if op == CoreOp::RegisterService as u8 => vec![echo(Vec::new())],
        (Service::Core, op) if op == CoreOp::UnregisterService as u8 => vec![echo(Vec::new())],
        (Service::Gap, op) if op == GapOp::ReadControllerInfo as u8 => {
            let info = ControllerInfo {
                addr: config.addr,
                supported_settings: supported_settings(),
                current_settings: *current,
                name: config.name.clone(),
            };
            match info.encode_payload() {
                Ok(payload) => vec![echo(payload)],
                Err(error) => {
                    warn!(%error, "fake controller info does not encode");
                    vec![status(frame, Status::Failed)]
                }
            }
        }
        (Service::Gap, op) if op == GapOp::SetConnectable as u8 => {
            *current = apply_toggle(*current, Settings::CONNECTABLE, frame.payload.first());
            vec![settings(*current)]
        }
        (Service::Gap, op) if op == GapOp::SetDiscoverable as u8 => {
            *current = apply_toggle(*current, Settings::DISCOVERABLE, frame.payload.first());
            vec![settings(*current)]
        }
        (Service::Gap, op) if op == GapOp::StartAdvertising as u8 => {
            *current = current.with(Settings::ADVERTISING);
            vec![settings(*current)]
        }
        (Service::Gap, op) if op == GapOp::StopAdvertising as u8 => {
            *current = current.without(Settings::ADVERTISING);
            vec![settings(*current)]
        }
        (Service::Gap, op) if op == GapOp::StartDiscovery as u8 => {
            let mut frames = vec![echo(Vec::new())];
            frames.extend(config.found.iter().filter_map(found_event));
            frames
        }
        (Service::Gap, op) if op == GapOp::StopDiscovery as u8 => vec![echo(Vec::new())],
        (Service::Gap, op) if op == GapOp::Connect as u8 => {
            let mut frames = vec![echo(Vec::new())];
            if !config.unreachable
                && let Some(peer) = decode_peer(&frame.payload)
            {
                frames.push(connected_event(peer));
            }
            frames
        }
        (Service::Gap, op) if op == GapOp::Disconnect as u8 => {
            let mut frames = vec![echo(Vec::new())];
            if let Some(peer) = decode_peer(&frame.payload) {
                let event = DeviceDisconnected { peer };
                frames.push(Frame::new(
                    Service::Gap,
                    GapEventId::Disconnected as u8,
                    event.encode_payload(),
                ));
            }
            frames
        }
        (Service::Gap, op) if op == GapOp::Pair as u8 => {
            let mut frames = vec![echo(Vec::new())];
            if let (Some(passkey), Some(peer)) = (config.passkey, decode_peer(&frame.payload)) {
                let event = PasskeyDisplay { peer, passkey };
                frames.push(Frame::new(
                    Service::Gap,
                    GapEventId::PasskeyDisplay as u8,
                    event.encode_payload(),
                ));
            }
            frames
        }
        (Service::Gap, op) if op == GapOp::Unpair as u8 => vec![echo(Vec::new())],
        (Service::Gap, op) if op == GapOp::PasskeyEntry as u8 => vec![echo(Vec::new())],
        (Service::Gatt, op) if op == GattOp::Read as u8 => {
            let mut payload = vec![0x00];
            let len = u16::try_from(config.read_value.len()).unwrap_or(u16::MAX);
            payload.extend_from_slice(&len.to_le_bytes());
            payload.extend_from_slice(&config.read_value[..usize::from(len)]);
            vec![echo(payload)]
        }
        (Service::Gatt, op) if op == GattOp::SignedWrite as u8 => vec![echo(Vec::new())],
        (Service::Mesh, op) if op == MeshOp::Init as u8 => vec![echo(Vec::new())],
        _ => vec![status(frame, Status::UnknownCommand)],
    }
}

fn supported_settings() -> Settings {
    Settings::POWERED
        .with(Settings::CONNECTABLE)
        .with(Settings::DISCOVERABLE)
        .with(Settings::BONDABLE)
        .with(Settings::LOW_ENERGY)
        .with(Settings::ADVERTISING)
}

fn apply_toggle(current: Settings, bit: Settings, enable: Option<&u8>) -> Settings {
    match enable {
        Some(0) | None => current.without(bit),
        Some(_) => current.with(bit),
    }
}

fn status(frame: &Frame, code: Status) -> Frame {
    Frame::new(frame.service, STATUS_OPCODE, vec![code as u8])
}

fn decode_peer(payload: &[u8]) -> Option<PeerAddr> {
    match read_peer(payload) {
        Ok(peer) => Some(peer),
        Err(error) => {
            warn!(%error, "fake IUT could not read the peer address");
            None
        }
    }
}

fn read_peer(payload: &[u8]) -> Result<PeerAddr, WireError> {
    let mut reader = PayloadReader::new(payload);
    let addr_type = reader.addr_type("addr_type")?;
    let addr = reader.addr("address")?;
    Ok(PeerAddr::new(addr_type, addr))
}

fn found_event(record: &FoundRecord) -> Option<Frame> {
    let event = DeviceFound {
        peer: record.peer,
        rssi: record.rssi,
        // RSSI valid plus advertising data present.
        flags: 0b0000_0011,
        eir: record.eir.clone(),
    };
    match event.encode_payload() {
        Ok(payload) => Some(Frame::new(
            Service::Gap,
            GapEventId::DeviceFound as u8,
            payload,
        )),
        Err(error) => {
            warn!(%error, "found-device fixture does not encode; skipping");
            None
        }
    }
}

fn connected_event(peer: PeerAddr) -> Frame {
    let event = DeviceConnected {
        peer,
        interval: FAKE_CONN_INTERVAL,
        latency: FAKE_CONN_LATENCY,
        supervision_timeout: FAKE_CONN_TIMEOUT,
    };
    Frame::new(
        Service::Gap,
        GapEventId::Connected as u8,
        event.encode_payload(),
    )
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::addr::AddrType;
    use crate::client::{ClientConfig, ClientError, CommandClient};
    use crate::proto::{
        Connect, DiscoveryFlags, GapEvent, Pair, ReadControllerInfo, RegisterService,
        StartDiscovery,
    };

    use super::*;

    #[rstest]
    #[case("public|DEADBEEFDEAD|-42|020106", AddrType::Public, vec![0x02, 0x01, 0x06])]
    #[case("random|C0FFEEC0FFEE|-70|-", AddrType::Random, vec![])]
    fn found_record_parses_fixture_form(
        #[case] text: &str,
        #[case] addr_type: AddrType,
        #[case] eir: Vec<u8>,
    ) {
        let record: FoundRecord = text.parse().expect("fixture record should parse");
        assert_eq!(addr_type, record.peer.addr_type);
        assert_eq!(eir, record.eir);
    }

    #[rstest]
    #[case("public|DEADBEEFDEAD|-42")]
    #[case("public|DEADBEEFDEAD|-42|0201|junk")]
    fn found_record_rejects_wrong_field_count(#[case] text: &str) {
        let result: Result<FoundRecord, _> = text.parse();
        assert_matches!(result, Err(FixtureError::InvalidFieldCount));
    }

    #[test]
    fn found_record_rejects_odd_hex() {
        let result: Result<FoundRecord, _> = "public|DEADBEEFDEAD|-42|ABC".parse();
        assert_matches!(result, Err(FixtureError::InvalidEir(_)));
    }

    #[test]
    fn found_fixture_splits_on_semicolons() {
        let fixture: FoundFixture = "public|DEADBEEFDEAD|-42|-;random|C0FFEEC0FFEE|-70|-"
            .parse()
            .expect("fixture list should parse");
        let records: Vec<FoundRecord> = fixture.into();
        assert_eq!(2, records.len());
    }

    #[test]
    fn empty_found_fixture_is_rejected() {
        let result: Result<FoundFixture, _> = "  ".parse();
        assert_matches!(result, Err(FixtureError::EmptyFixture));
    }

    fn fixture_peer() -> PeerAddr {
        PeerAddr::new(
            AddrType::Public,
            DeviceAddr::new([0xC0, 0xFF, 0xEE, 0xC0, 0xFF, 0xEE]),
        )
    }

    #[tokio::test]
    async fn fake_answers_controller_info_with_its_identity() {
        let transport = spawn_fake_iut(
            FakeIutConfig::builder()
                .addr(DeviceAddr::new([0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD]))
                .name("iut-under-test")
                .build(),
        );
        let client = CommandClient::spawn(transport, ClientConfig::default());

        client
            .send(&RegisterService {
                service: Service::Gap,
            })
            .await
            .expect("service registration should succeed");
        let info = client
            .send(&ReadControllerInfo)
            .await
            .expect("controller info should decode");

        assert_eq!("DEADBEEFDEAD", info.addr.to_string());
        assert_eq!("iut-under-test", info.name);
        assert!(info.current_settings.contains(Settings::POWERED));
    }

    #[tokio::test]
    async fn discovery_replays_found_fixtures_as_events() {
        let record = FoundRecord {
            peer: fixture_peer(),
            rssi: -42,
            eir: vec![0x02, 0x01, 0x06],
        };
        let transport =
            spawn_fake_iut(FakeIutConfig::builder().found(vec![record.clone()]).build());
        let client = CommandClient::spawn(transport, ClientConfig::default());
        let mut events = client.subscribe(GapEventId::DeviceFound);

        client
            .send(&StartDiscovery {
                flags: DiscoveryFlags::active_le(),
            })
            .await
            .expect("discovery should start");

        let frame = events.next().await.expect("found event should arrive");
        let event = GapEvent::decode(frame.opcode, &frame.payload)
            .expect("event should decode")
            .expect("opcode should be known");
        assert_matches!(event, GapEvent::DeviceFound(found) => {
            assert_eq!(record.peer, found.peer);
            assert_eq!(record.rssi, found.rssi);
            assert_eq!(record.eir, found.eir);
        });
    }

    #[tokio::test]
    async fn connect_emits_a_connected_event_unless_unreachable() {
        let transport = spawn_fake_iut(FakeIutConfig::default());
        let client = CommandClient::spawn(transport, ClientConfig::default());
        let mut events = client.subscribe(GapEventId::Connected);

        client
            .send(&Connect {
                peer: fixture_peer(),
            })
            .await
            .expect("connect should succeed");

        let frame = events.next().await.expect("connected event should arrive");
        let event = GapEvent::decode(frame.opcode, &frame.payload)
            .expect("event should decode")
            .expect("opcode should be known");
        assert_matches!(event, GapEvent::Connected(connected) => {
            assert_eq!(fixture_peer(), connected.peer);
        });
    }

    #[tokio::test]
    async fn pairing_displays_the_scripted_passkey() {
        let transport = spawn_fake_iut(FakeIutConfig::builder().passkey(915_425).build());
        let client = CommandClient::spawn(transport, ClientConfig::default());
        let mut events = client.subscribe(GapEventId::PasskeyDisplay);

        client
            .send(&Pair {
                peer: fixture_peer(),
            })
            .await
            .expect("pair should succeed");

        let frame = events.next().await.expect("passkey event should arrive");
        let event = GapEvent::decode(frame.opcode, &frame.payload)
            .expect("event should decode")
            .expect("opcode should be known");
        assert_matches!(event, GapEvent::PasskeyDisplay(display) => {
            assert_eq!(915_425, display.passkey);
        });
    }

    #[tokio::test]
    async fn scripted_rejection_surfaces_as_a_rejected_send() {
        let transport = spawn_fake_iut(
            FakeIutConfig::builder()
                .rejects(vec![(Service::Gap, GapOp::ReadControllerInfo as u8)])
                .build(),
        );
        let client = CommandClient::spawn(transport, ClientConfig::default());

        let result = client.send(&ReadControllerInfo).await;
        assert_matches!(
            result,
            Err(ClientError::Rejected { code }) if code == Status::Failed as u8
        );
    }
}
