use indexmap::IndexMap;
use strum_macros::{Display as StrumDisplay, FromRepr};

use crate::addr::{DeviceAddr, PeerAddr};
use crate::proto::{GapEvent, Settings};

use super::StackError;

/// Legacy advertising payload cap in bytes.
pub const AD_PAYLOAD_BUDGET: usize = 31;

/// Length and type bytes preceding every encoded AD element.
const AD_HEADER_LEN: usize = 2;

/// Assigned numbers for the AD element types the bridge emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum AdType {
    Flags = 0x01,
    Uuid16Some = 0x02,
    NameShort = 0x08,
    NameFull = 0x09,
    TxPower = 0x0A,
    Uri = 0x24,
    ManufacturerData = 0xFF,
}

impl AdType {
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }
}

/// Insertion-ordered advertising elements under the legacy payload cap.
///
/// Every mutation is checked against the cap before it is applied, so the
/// store can always be encoded into a valid legacy advertising payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdStore {
    elements: IndexMap<AdType, Vec<u8>>,
}

impl AdStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces one element.
    ///
    /// The write is atomic with respect to the budget: when the new value
    /// would push the encoded payload past [`AD_PAYLOAD_BUDGET`] the store
    /// is left exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::AdBudgetExceeded`] on overflow.
    ///
    /// ```
    /// use certbridge::{AdStore, AdType};
    ///
    /// let mut store = AdStore::new();
    /// store.set(AdType::Flags, vec![0x02])?;
    /// assert_eq!(3, store.encoded_len());
    /// # Ok::<(), certbridge::StackError>(())
    /// ```
    pub fn set(&mut self, ad_type: AdType, value: impl Into<Vec<u8>>) -> Result<(), StackError> {
        let value = value.into();
        let replaced_cost = self
            .elements
            .get(&ad_type)
            .map_or(0, |existing| AD_HEADER_LEN + existing.len());
        let needed = self.encoded_len() - replaced_cost + AD_HEADER_LEN + value.len();
        if needed > AD_PAYLOAD_BUDGET {
            return Err(StackError::AdBudgetExceeded {
                ad_type,
                needed,
                budget: AD_PAYLOAD_BUDGET,
            });
        }

        self.elements.insert(ad_type, value);
        Ok(())
    }

    pub fn remove(&mut self, ad_type: AdType) -> Option<Vec<u8>> {
        self.elements.shift_remove(&ad_type)
    }

    #[must_use]
    pub fn get(&self, ad_type: AdType) -> Option<&[u8]> {
        self.elements.get(&ad_type).map(Vec::as_slice)
    }

    #[must_use]
    pub fn contains(&self, ad_type: AdType) -> bool {
        self.elements.contains_key(&ad_type)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Total bytes the store occupies once encoded.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.elements
            .values()
            .map(|value| AD_HEADER_LEN + value.len())
            .sum()
    }

    /// Serialises the elements in insertion order as `len | type | value`
    /// triples, where `len` counts the type byte.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(self.encoded_len());
        for (ad_type, value) in &self.elements {
            // set() keeps every element under the 31-byte cap, so the
            // length always fits one byte.
            encoded.push((value.len() + 1) as u8);
            encoded.push(ad_type.id());
            encoded.extend_from_slice(value);
        }
        encoded
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }
}

/// One peer observed during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub peer: PeerAddr,
    pub rssi: i8,
    pub eir: Vec<u8>,
    /// Local name carried in the EIR blob, when present.
    pub name: Option<String>,
}

/// Discovery results deduplicated by peer address. The latest observation
/// of a peer wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryLog {
    devices: IndexMap<PeerAddr, FoundDevice>,
}

impl DiscoveryLog {
    pub fn record(&mut self, peer: PeerAddr, rssi: i8, eir: Vec<u8>) {
        let name = eir_local_name(&eir);
        self.devices.insert(
            peer,
            FoundDevice {
                peer,
                rssi,
                eir,
                name,
            },
        );
    }

    #[must_use]
    pub fn contains(&self, peer: PeerAddr) -> bool {
        self.devices.contains_key(&peer)
    }

    /// Looks a peer up by bare address, ignoring the address type.
    #[must_use]
    pub fn find_addr(&self, addr: DeviceAddr) -> Option<&FoundDevice> {
        self.devices.values().find(|device| device.peer.addr == addr)
    }

    pub fn devices(&self) -> impl Iterator<Item = &FoundDevice> {
        self.devices.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

/// Extracts the complete or shortened local name from an EIR blob.
fn eir_local_name(eir: &[u8]) -> Option<String> {
    let mut rest = eir;
    while let [len, tail @ ..] = rest {
        let len = usize::from(*len);
        if len == 0 || tail.len() < len {
            break;
        }
        let (element, next) = tail.split_at(len);
        rest = next;
        let [ad_type, data @ ..] = element else {
            break;
        };
        if let Some(AdType::NameFull | AdType::NameShort) = AdType::from_repr(*ad_type) {
            return Some(String::from_utf8_lossy(data).into_owned());
        }
    }
    None
}

/// The controller identity reported by the IUT at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerIdentity {
    pub addr: DeviceAddr,
    pub name: String,
    pub supported_settings: Settings,
    pub current_settings: Settings,
}

/// An established link and its connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub peer: PeerAddr,
    pub interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

/// Where pairing with the current peer stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, StrumDisplay)]
#[strum(serialize_all = "snake_case")]
pub enum PairingState {
    #[default]
    None,
    InProgress,
    Bonded,
}

/// Mutable GAP-side mirror of the IUT.
///
/// The advertising stores enforce their own payload invariant; everything
/// else is a plain record the handlers and the event pump read and write.
#[derive(Debug, Clone, Default)]
pub struct GapState {
    pub identity: Option<ControllerIdentity>,
    /// The tester-side device the case targets, primed at setup.
    pub peer: Option<PeerAddr>,
    pub advertising: AdStore,
    pub scan_response: AdStore,
    pub discovery: DiscoveryLog,
    pub connection: Option<Connection>,
    pub pairing: PairingState,
    pub passkey: Option<u32>,
}

impl GapState {
    /// Own address as reported at bootstrap.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::IdentityUnknown`] before controller info has
    /// been read.
    pub fn own_addr(&self) -> Result<DeviceAddr, StackError> {
        self.identity
            .as_ref()
            .map(|identity| identity.addr)
            .ok_or(StackError::IdentityUnknown)
    }

    /// Address of the device this case talks to.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::PeerUnknown`] when setup never primed one.
    pub fn target_peer(&self) -> Result<PeerAddr, StackError> {
        self.peer.ok_or(StackError::PeerUnknown)
    }

    /// Peer of the active connection.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NoConnection`] while disconnected.
    pub fn connected_peer(&self) -> Result<PeerAddr, StackError> {
        self.connection
            .map(|connection| connection.peer)
            .ok_or(StackError::NoConnection)
    }

    /// Folds the settings bits from a command reply into the identity.
    pub fn update_settings(&mut self, settings: Settings) {
        if let Some(identity) = self.identity.as_mut() {
            identity.current_settings = settings;
        }
    }

    /// Reflects an unsolicited event into the mirrored state.
    pub fn apply_event(&mut self, event: &GapEvent) {
        match event {
            GapEvent::DeviceFound(found) => {
                self.discovery.record(found.peer, found.rssi, found.eir.clone());
            }
            GapEvent::Connected(connected) => {
                self.connection = Some(Connection {
                    peer: connected.peer,
                    interval: connected.interval,
                    latency: connected.latency,
                    supervision_timeout: connected.supervision_timeout,
                });
            }
            GapEvent::Disconnected(disconnected) => {
                if self
                    .connection
                    .is_some_and(|connection| connection.peer == disconnected.peer)
                {
                    self.connection = None;
                    self.pairing = PairingState::None;
                }
            }
            GapEvent::PasskeyDisplay(display) => {
                self.passkey = Some(display.passkey);
                self.pairing = PairingState::InProgress;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::addr::AddrType;
    use crate::proto::gap::{DeviceConnected, DeviceDisconnected, DeviceFound, PasskeyDisplay};

    use super::*;

    fn peer() -> PeerAddr {
        PeerAddr::new(
            AddrType::Public,
            DeviceAddr::new([0xC0, 0xFF, 0xEE, 0xC0, 0xFF, 0xEE]),
        )
    }

    #[test]
    fn ad_store_encodes_in_insertion_order() {
        let mut store = AdStore::new();
        store.set(AdType::Flags, vec![0x06]).expect("flags fit");
        store
            .set(AdType::NameFull, b"iut".to_vec())
            .expect("name fits");

        assert_eq!(
            vec![0x02, 0x01, 0x06, 0x04, 0x09, b'i', b'u', b't'],
            store.encode()
        );
        assert_eq!(8, store.encoded_len());
    }

    #[test]
    fn overflowing_write_leaves_the_store_untouched() {
        let mut store = AdStore::new();
        store
            .set(AdType::NameFull, vec![0xAA; 20])
            .expect("20 bytes fit under the cap");
        let before = store.clone();

        let result = store.set(AdType::ManufacturerData, vec![0xBB; 8]);

        assert_matches!(
            result,
            Err(StackError::AdBudgetExceeded {
                ad_type: AdType::ManufacturerData,
                needed: 32,
                budget: AD_PAYLOAD_BUDGET,
            })
        );
        assert_eq!(before, store);
    }

    #[test]
    fn replacing_an_element_frees_its_old_cost() {
        let mut store = AdStore::new();
        store
            .set(AdType::NameFull, vec![0xAA; 25])
            .expect("25 bytes fit under the cap");

        store
            .set(AdType::NameFull, vec![0xBB; 29])
            .expect("replacement should reuse the freed bytes");
        assert_eq!(AD_PAYLOAD_BUDGET, store.encoded_len());
    }

    #[rstest]
    #[case(vec![0xAA; 29], true)]
    #[case(vec![0xAA; 30], false)]
    fn single_element_fills_the_budget_exactly(#[case] value: Vec<u8>, #[case] fits: bool) {
        let mut store = AdStore::new();
        assert_eq!(fits, store.set(AdType::ManufacturerData, value).is_ok());
    }

    #[test]
    fn discovery_deduplicates_and_keeps_the_latest_observation() {
        let mut log = DiscoveryLog::default();
        log.record(peer(), -40, vec![]);
        log.record(peer(), -60, vec![]);

        assert_eq!(1, log.len());
        let device = log
            .find_addr(peer().addr)
            .expect("peer should be on record");
        assert_eq!(-60, device.rssi);
    }

    #[test]
    fn discovery_extracts_the_local_name_from_eir() {
        let mut log = DiscoveryLog::default();
        let eir = vec![0x02, 0x01, 0x06, 0x05, 0x09, b'z', b'e', b'p', b'h'];
        log.record(peer(), -42, eir);

        let device = log.find_addr(peer().addr).expect("peer should be on record");
        assert_eq!(Some("zeph".to_owned()), device.name);
    }

    #[test]
    fn truncated_eir_yields_no_name() {
        let mut log = DiscoveryLog::default();
        log.record(peer(), -42, vec![0x09, 0x09, b'x']);

        let device = log.find_addr(peer().addr).expect("peer should be on record");
        assert_eq!(None, device.name);
    }

    #[test]
    fn connected_event_fills_the_connection_slot() {
        let mut state = GapState::default();
        state.apply_event(&GapEvent::Connected(DeviceConnected {
            peer: peer(),
            interval: 0x0028,
            latency: 0,
            supervision_timeout: 0x002A,
        }));

        let connected = state.connected_peer().expect("connection should be up");
        assert_eq!(peer(), connected);
    }

    #[test]
    fn disconnect_of_the_active_peer_clears_the_slot() {
        let mut state = GapState::default();
        state.apply_event(&GapEvent::Connected(DeviceConnected {
            peer: peer(),
            interval: 0x0028,
            latency: 0,
            supervision_timeout: 0x002A,
        }));
        state.apply_event(&GapEvent::Disconnected(DeviceDisconnected { peer: peer() }));

        assert_matches!(state.connected_peer(), Err(StackError::NoConnection));
    }

    #[test]
    fn disconnect_of_another_peer_is_ignored() {
        let other = PeerAddr::new(
            AddrType::Random,
            DeviceAddr::new([0x0B, 0xAD, 0xC0, 0xDE, 0x0B, 0xAD]),
        );
        let mut state = GapState::default();
        state.apply_event(&GapEvent::Connected(DeviceConnected {
            peer: peer(),
            interval: 0x0028,
            latency: 0,
            supervision_timeout: 0x002A,
        }));
        state.apply_event(&GapEvent::Disconnected(DeviceDisconnected { peer: other }));

        assert!(state.connection.is_some());
    }

    #[test]
    fn passkey_display_marks_pairing_in_progress() {
        let mut state = GapState::default();
        state.apply_event(&GapEvent::PasskeyDisplay(PasskeyDisplay {
            peer: peer(),
            passkey: 915_425,
        }));

        assert_eq!(Some(915_425), state.passkey);
        assert_matches!(state.pairing, PairingState::InProgress);
    }

    #[test]
    fn found_event_lands_in_the_discovery_log() {
        let mut state = GapState::default();
        state.apply_event(&GapEvent::DeviceFound(DeviceFound {
            peer: peer(),
            rssi: -42,
            flags: 0x03,
            eir: vec![0x02, 0x01, 0x06],
        }));

        assert!(state.discovery.contains(peer()));
    }
}
