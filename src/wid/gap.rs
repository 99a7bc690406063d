//! GAP prompt handlers.
//!
//! Each handler performs what its prompt asks for, or checks the condition
//! the prompt describes, against the live control connection and the
//! mirrored device state. The same handler serves every wid whose prompt
//! asks for the same action.

use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::addr::PeerAddr;
use crate::client::EventStream;
use crate::proto::{
    Connect, Disconnect, DiscoverableMode, DiscoveryFlags, GapEvent, GapEventId, Pair,
    ReadCharacteristic, SetConnectable, SetDiscoverable, SignedWrite, StartAdvertising,
    StartDiscovery, StopAdvertising, StopDiscovery, Unpair,
};
use crate::stack::{AdType, PairingState};

use super::describe;
use super::{WidContext, WidError, WidgetRegistry, WidgetReply};

/// Upper bound on waits for a condition the tester expects to observe.
const EVENT_WINDOW: Duration = Duration::from_secs(10);

/// Prompts that only describe tester-side steps and need a plain
/// acknowledgement.
const CONFIRM_ONLY: &[u16] = &[
    46, 82, 83, 84, 85, 104, 114, 118, 120, 124, 158, 162, 176, 177, 178,
];

/// Builds the GAP handler table.
///
/// # Errors
///
/// Returns [`WidError::DuplicateWidget`] if a wid is bound twice.
pub fn gap_table() -> Result<WidgetRegistry, WidError> {
    let mut table = WidgetRegistry::new();

    table.register(4, discovery_found_any)?;
    table.register(5, advertise_undirected_hidden)?;
    table.register(10, peer_appeared_in_discovery)?;
    table.register(11, peer_absent_from_discovery)?;
    table.register(12, start_passive_observation)?;
    table.register(13, start_limited_discovery)?;
    table.register(20, set_nonconnectable)?;
    table.register(21, advertise_connectable)?;
    table.register(23, start_general_discovery)?;
    table.register(24, begin_advertising)?;
    table.register(25, advertise_with_flags)?;
    table.register(26, advertise_with_manufacturer_data)?;
    table.register(27, advertise_with_tx_power)?;
    table.register(40, connect_to_peer)?;
    table.register(44, disconnect_from_peer)?;
    table.register(51, advertise_general_nonconnectable)?;
    table.register(77, disconnect_from_peer)?;
    table.register(78, connect_to_peer)?;
    table.register(80, restart_advertising_hidden)?;
    table.register(100, pair_with_peer)?;
    table.register(106, pair_with_peer)?;
    table.register(108, pair_with_peer)?;
    table.register(112, read_attribute)?;
    table.register(121, enter_limited_discoverable)?;
    table.register(122, enter_general_discoverable)?;
    table.register(125, signed_write_attribute)?;
    table.register(135, remove_bond)?;
    table.register(138, observe_then_verify_peer)?;
    table.register(148, connect_expect_no_link)?;
    table.register(157, observe_then_verify_peer)?;
    table.register(161, read_attribute_length)?;
    table.register(169, start_active_observation)?;
    table.register(173, advertise_uri_scan_response)?;
    table.register(204, observe_and_report_any)?;
    table.register(1002, report_displayed_passkey)?;
    table.register(2142, connect_to_peer)?;

    for wid in CONFIRM_ONLY.iter().copied() {
        table.register(wid, confirm)?;
    }

    Ok(table)
}

/// Acknowledges a prompt that needs no action from the device.
async fn confirm(_context: WidContext, _description: String) -> Result<WidgetReply, WidError> {
    Ok(WidgetReply::Confirm)
}

/// Reports whether the running discovery has turned up any device, then
/// stops it.
async fn discovery_found_any(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let found = any_device_within(&context, EVENT_WINDOW).await;
    context.client.send(&StopDiscovery).await?;
    Ok(verdict(found))
}

/// Advertises as neither connectable nor discoverable.
async fn advertise_undirected_hidden(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    set_connectable(&context, false).await?;
    set_discoverable(&context, DiscoverableMode::Off).await?;
    enable_advertising(&context).await?;
    Ok(WidgetReply::Confirm)
}

/// Reports whether the configured peer showed up in discovery, then stops
/// it.
async fn peer_appeared_in_discovery(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let peer = target(&context)?;
    let mut events = context.client.subscribe(GapEventId::DeviceFound);
    let found = peer_discovered_within(&context, &mut events, peer, EVENT_WINDOW).await?;
    context.client.send(&StopDiscovery).await?;
    Ok(verdict(found))
}

/// Confirms the configured peer stayed out of the discovery results.
async fn peer_absent_from_discovery(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let peer = target(&context)?;
    context.client.send(&StopDiscovery).await?;
    let absent = context
        .stack
        .with(|stack| !stack.gap.discovery.contains(peer));
    Ok(verdict(absent))
}

async fn start_passive_observation(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    start_discovery(&context, DiscoveryFlags::observing()).await?;
    Ok(WidgetReply::Confirm)
}

async fn start_limited_discovery(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let flags = DiscoveryFlags {
        limited: true,
        ..DiscoveryFlags::active_le()
    };
    start_discovery(&context, flags).await?;
    Ok(WidgetReply::Confirm)
}

async fn set_nonconnectable(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    set_connectable(&context, false).await?;
    Ok(WidgetReply::Confirm)
}

/// Advertises as connectable.
async fn advertise_connectable(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    set_connectable(&context, true).await?;
    enable_advertising(&context).await?;
    Ok(WidgetReply::Confirm)
}

async fn start_general_discovery(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    start_discovery(&context, DiscoveryFlags::active_le()).await?;
    Ok(WidgetReply::Confirm)
}

/// Turns advertising on with whatever elements the case has primed.
async fn begin_advertising(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    enable_advertising(&context).await?;
    Ok(WidgetReply::Confirm)
}

/// Advertises with a flags element, seeding general discoverability when
/// the case has not primed one.
async fn advertise_with_flags(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    context.stack.with(|stack| {
        if stack.gap.advertising.contains(AdType::Flags) {
            Ok(())
        } else {
            // General discoverable, BR/EDR not supported.
            stack.gap.advertising.set(AdType::Flags, vec![0x06])
        }
    })?;
    enable_advertising(&context).await?;
    Ok(WidgetReply::Confirm)
}

/// Advertises with a manufacturer-specific element, defaulting to the
/// company identifier reserved for testing.
async fn advertise_with_manufacturer_data(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    context.stack.with(|stack| {
        if stack.gap.advertising.contains(AdType::ManufacturerData) {
            Ok(())
        } else {
            stack
                .gap
                .advertising
                .set(AdType::ManufacturerData, vec![0xFF, 0xFF, 0xAB, 0xCD])
        }
    })?;
    enable_advertising(&context).await?;
    Ok(WidgetReply::Confirm)
}

/// Advertises with a TX power element. The tester reads the level off the
/// air, so any value satisfies it.
async fn advertise_with_tx_power(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    context
        .stack
        .with(|stack| stack.gap.advertising.set(AdType::TxPower, vec![0x00]))?;
    enable_advertising(&context).await?;
    Ok(WidgetReply::Confirm)
}

/// Initiates a connection to the configured peer.
async fn connect_to_peer(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let peer = target(&context)?;
    context.client.send(&Connect { peer }).await?;
    Ok(WidgetReply::Confirm)
}

/// Tears the link down, preferring the live connection's peer.
async fn disconnect_from_peer(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let peer = context.stack.with(|stack| {
        stack
            .gap
            .connected_peer()
            .or_else(|_unconnected| stack.gap.target_peer())
    })?;
    context.client.send(&Disconnect { peer }).await?;
    Ok(WidgetReply::Confirm)
}

/// Advertises as general discoverable but not connectable.
async fn advertise_general_nonconnectable(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    set_connectable(&context, false).await?;
    set_discoverable(&context, DiscoverableMode::General).await?;
    enable_advertising(&context).await?;
    Ok(WidgetReply::Confirm)
}

/// Restarts advertising as neither connectable nor discoverable.
async fn restart_advertising_hidden(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    stop_advertising(&context).await?;
    set_connectable(&context, false).await?;
    set_discoverable(&context, DiscoverableMode::Off).await?;
    enable_advertising(&context).await?;
    Ok(WidgetReply::Confirm)
}

/// Starts pairing with the configured peer.
async fn pair_with_peer(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let peer = target(&context)?;
    context.client.send(&Pair { peer }).await?;
    context
        .stack
        .with(|stack| stack.gap.pairing = PairingState::InProgress);
    Ok(WidgetReply::Confirm)
}

/// Reads the attribute named in the prompt over GATT.
async fn read_attribute(
    context: WidContext,
    description: String,
) -> Result<WidgetReply, WidError> {
    let handle = describe::attribute_handle(&description).ok_or(WidError::Description {
        expected: "an attribute handle",
    })?;
    let peer = target(&context)?;
    context
        .client
        .send(&ReadCharacteristic { peer, handle })
        .await?;
    Ok(WidgetReply::Confirm)
}

async fn enter_limited_discoverable(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    set_discoverable(&context, DiscoverableMode::Limited).await?;
    set_connectable(&context, false).await?;
    Ok(WidgetReply::Confirm)
}

async fn enter_general_discoverable(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    set_connectable(&context, false).await?;
    set_discoverable(&context, DiscoverableMode::General).await?;
    Ok(WidgetReply::Confirm)
}

/// Performs a signed write of a single set byte to the prompt's handle.
async fn signed_write_attribute(
    context: WidContext,
    description: String,
) -> Result<WidgetReply, WidError> {
    let handle = describe::attribute_handle(&description).ok_or(WidError::Description {
        expected: "an attribute handle",
    })?;
    let peer = target(&context)?;
    let write = SignedWrite::new(peer, handle, vec![0x01])?;
    context.client.send(&write).await?;
    Ok(WidgetReply::Confirm)
}

/// Removes the bond with the configured peer.
async fn remove_bond(context: WidContext, _description: String) -> Result<WidgetReply, WidError> {
    let peer = target(&context)?;
    context.client.send(&Unpair { peer }).await?;
    context
        .stack
        .with(|stack| stack.gap.pairing = PairingState::None);
    Ok(WidgetReply::Confirm)
}

/// Attempts a connection that must not complete.
async fn connect_expect_no_link(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let peer = target(&context)?;
    let mut events = context.client.subscribe(GapEventId::Connected);
    context.client.send(&Connect { peer }).await?;
    let connected = link_established_within(&context, &mut events, peer, EVENT_WINDOW).await?;
    Ok(verdict(!connected))
}

/// Answers with the byte length of the attribute named in the prompt.
async fn read_attribute_length(
    context: WidContext,
    description: String,
) -> Result<WidgetReply, WidError> {
    let handle = describe::attribute_handle(&description).ok_or(WidError::Description {
        expected: "an attribute handle",
    })?;
    let peer = target(&context)?;
    let read = context
        .client
        .send(&ReadCharacteristic { peer, handle })
        .await?;
    Ok(WidgetReply::Number(read.value.len() as u64))
}

async fn start_active_observation(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let flags = DiscoveryFlags {
        active: true,
        ..DiscoveryFlags::observing()
    };
    start_discovery(&context, flags).await?;
    Ok(WidgetReply::Confirm)
}

/// Advertises the sample URI in the scan response and nothing else there.
async fn advertise_uri_scan_response(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    // 0x17 encodes the `https:` scheme.
    let mut uri = vec![0x17];
    uri.extend_from_slice(b"//example.org/");
    context.stack.with(|stack| {
        stack.gap.scan_response.clear();
        stack.gap.scan_response.set(AdType::Uri, uri)
    })?;
    enable_advertising(&context).await?;
    Ok(WidgetReply::Confirm)
}

/// Observes passively and reports whether anything was heard.
async fn observe_and_report_any(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    start_discovery(&context, DiscoveryFlags::observing()).await?;
    Ok(verdict(any_device_within(&context, EVENT_WINDOW).await))
}

/// Runs a fresh active observation scan and reports whether the configured
/// peer was heard before the window closed.
async fn observe_then_verify_peer(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let peer = target(&context)?;
    let mut events = context.client.subscribe(GapEventId::DeviceFound);
    let flags = DiscoveryFlags {
        active: true,
        ..DiscoveryFlags::observing()
    };
    start_discovery(&context, flags).await?;
    let found = peer_discovered_within(&context, &mut events, peer, EVENT_WINDOW).await?;
    context.client.send(&StopDiscovery).await?;
    Ok(verdict(found))
}

/// Reports the passkey the device is showing.
async fn report_displayed_passkey(
    context: WidContext,
    _description: String,
) -> Result<WidgetReply, WidError> {
    let mut events = context.client.subscribe(GapEventId::PasskeyDisplay);
    if let Some(passkey) = context.stack.with(|stack| stack.gap.passkey) {
        return Ok(WidgetReply::Number(passkey.into()));
    }

    let deadline = sleep(EVENT_WINDOW);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            frame = events.next() => match frame {
                Some(frame) => {
                    if let Some(GapEvent::PasskeyDisplay(display)) =
                        GapEvent::decode(frame.opcode, &frame.payload)?
                    {
                        return Ok(WidgetReply::Number(display.passkey.into()));
                    }
                }
                None => break,
            },
            () = &mut deadline => {
                // The event pump may have recorded a passkey we never saw.
                if let Some(passkey) = context.stack.with(|stack| stack.gap.passkey) {
                    return Ok(WidgetReply::Number(passkey.into()));
                }
                break;
            }
        }
    }
    Err(WidError::EventWindowElapsed {
        what: "passkey display",
        window: EVENT_WINDOW,
    })
}

fn verdict(positive: bool) -> WidgetReply {
    if positive {
        WidgetReply::Confirm
    } else {
        WidgetReply::Deny
    }
}

fn target(context: &WidContext) -> Result<PeerAddr, WidError> {
    Ok(context.stack.with(|stack| stack.gap.target_peer())?)
}

async fn set_connectable(context: &WidContext, enable: bool) -> Result<(), WidError> {
    let settings = context.client.send(&SetConnectable { enable }).await?;
    context
        .stack
        .with(|stack| stack.gap.update_settings(settings));
    Ok(())
}

async fn set_discoverable(context: &WidContext, mode: DiscoverableMode) -> Result<(), WidError> {
    let settings = context.client.send(&SetDiscoverable { mode }).await?;
    context
        .stack
        .with(|stack| stack.gap.update_settings(settings));
    Ok(())
}

/// Renders both element stores and turns advertising on.
async fn enable_advertising(context: &WidContext) -> Result<(), WidError> {
    let (adv_data, scan_rsp) = context.stack.with(|stack| {
        (
            stack.gap.advertising.encode(),
            stack.gap.scan_response.encode(),
        )
    });
    let command = StartAdvertising::new(adv_data, scan_rsp)?;
    let settings = context.client.send(&command).await?;
    context
        .stack
        .with(|stack| stack.gap.update_settings(settings));
    Ok(())
}

async fn stop_advertising(context: &WidContext) -> Result<(), WidError> {
    let settings = context.client.send(&StopAdvertising).await?;
    context
        .stack
        .with(|stack| stack.gap.update_settings(settings));
    Ok(())
}

/// Starts a discovery round with a clean result log.
async fn start_discovery(context: &WidContext, flags: DiscoveryFlags) -> Result<(), WidError> {
    context.stack.with(|stack| stack.gap.discovery.clear());
    context.client.send(&StartDiscovery { flags }).await?;
    Ok(())
}

/// Waits until the discovery log or the event stream yields a device.
async fn any_device_within(context: &WidContext, window: Duration) -> bool {
    let mut events = context.client.subscribe(GapEventId::DeviceFound);
    if context.stack.with(|stack| !stack.gap.discovery.is_empty()) {
        return true;
    }
    match timeout(window, events.next()).await {
        Ok(Some(_found)) => true,
        Ok(None) => false,
        // The event pump may have recorded devices this wait never saw.
        Err(_elapsed) => context.stack.with(|stack| !stack.gap.discovery.is_empty()),
    }
}

/// Waits until the configured peer shows up in discovery.
async fn peer_discovered_within(
    context: &WidContext,
    events: &mut EventStream,
    peer: PeerAddr,
    window: Duration,
) -> Result<bool, WidError> {
    if context.stack.with(|stack| stack.gap.discovery.contains(peer)) {
        return Ok(true);
    }

    let deadline = sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            frame = events.next() => match frame {
                Some(frame) => {
                    if let Some(GapEvent::DeviceFound(found)) =
                        GapEvent::decode(frame.opcode, &frame.payload)?
                        && found.peer == peer
                    {
                        return Ok(true);
                    }
                }
                None => return Ok(false),
            },
            () = &mut deadline => {
                return Ok(context.stack.with(|stack| stack.gap.discovery.contains(peer)));
            }
        }
    }
}

/// Waits until a link to the peer is up.
async fn link_established_within(
    context: &WidContext,
    events: &mut EventStream,
    peer: PeerAddr,
    window: Duration,
) -> Result<bool, WidError> {
    let linked = |context: &WidContext| {
        context.stack.with(|stack| {
            stack
                .gap
                .connection
                .is_some_and(|connection| connection.peer == peer)
        })
    };
    if linked(context) {
        return Ok(true);
    }

    let deadline = sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            frame = events.next() => match frame {
                Some(frame) => {
                    if let Some(GapEvent::Connected(connected)) =
                        GapEvent::decode(frame.opcode, &frame.payload)?
                        && connected.peer == peer
                    {
                        return Ok(true);
                    }
                }
                None => return Ok(false),
            },
            () = &mut deadline => return Ok(linked(context)),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use crate::addr::{AddrType, DeviceAddr};
    use crate::client::fake::{FakeIutConfig, FoundRecord, spawn_fake_iut};
    use crate::client::{ClientConfig, CommandClient};
    use crate::pixit::{PixitStore, Profile, SharedPixit};
    use crate::proto::Settings;
    use crate::stack::{ControllerIdentity, SharedStack};
    use crate::synch::{Rendezvous, Role};
    use crate::wid::{WidgetDispatcher, WidgetId};

    use super::*;

    fn fake_context(config: FakeIutConfig) -> WidContext {
        let transport = spawn_fake_iut(config);
        WidContext {
            role: Role::new("tester"),
            client: CommandClient::spawn(transport, ClientConfig::default()),
            stack: SharedStack::new(),
            pixit: SharedPixit::new(PixitStore::for_profile(Profile::Gap)),
            synch: Rendezvous::default(),
        }
    }

    fn dispatcher_over(config: FakeIutConfig) -> WidgetDispatcher {
        let context = fake_context(config);
        WidgetDispatcher::new(gap_table().expect("gap table should build"), context)
    }

    fn scripted_peer() -> PeerAddr {
        PeerAddr::new(
            AddrType::Public,
            DeviceAddr::new([0x00, 0x1B, 0xDC, 0xF2, 0x1C, 0x55]),
        )
    }

    fn prime_target(context: &WidContext, peer: PeerAddr) {
        context.stack.with(|stack| stack.gap.peer = Some(peer));
    }

    fn prime_identity(context: &WidContext) {
        context.stack.with(|stack| {
            stack.gap.identity = Some(ControllerIdentity {
                addr: DeviceAddr::new([0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD]),
                name: "iut".to_owned(),
                supported_settings: Settings::from_bits(0xFFFF),
                current_settings: Settings::POWERED,
            });
        });
    }

    #[test]
    fn the_table_binds_every_gap_prompt() {
        let table = gap_table().expect("gap table should build");
        assert!(table.contains(WidgetId::new(4)));
        assert!(table.contains(WidgetId::new(138)));
        assert!(table.contains(WidgetId::new(157)));
        assert!(table.contains(WidgetId::new(173)));
        assert!(table.contains(WidgetId::new(1002)));
        assert!(table.contains(WidgetId::new(46)));
        assert_eq!(36 + CONFIRM_ONLY.len(), table.len());
    }

    #[tokio::test]
    async fn advertising_prompts_turn_the_radio_on() {
        let dispatcher = dispatcher_over(FakeIutConfig::default());
        prime_identity(dispatcher.context());

        let reply = dispatcher
            .dispatch(WidgetId::new(21), "Please prepare IUT into connectable mode.")
            .await;

        assert_eq!(WidgetReply::Confirm, reply);
        let settings = dispatcher.context().stack.with(|stack| {
            stack
                .gap
                .identity
                .as_ref()
                .map(|identity| identity.current_settings)
                .expect("identity should be primed")
        });
        assert!(settings.contains(Settings::CONNECTABLE));
        assert!(settings.contains(Settings::ADVERTISING));
    }

    #[tokio::test]
    async fn a_full_advertisement_rejects_the_tx_power_prompt() {
        let dispatcher = dispatcher_over(FakeIutConfig::default());
        dispatcher
            .context()
            .stack
            .with(|stack| {
                stack
                    .gap
                    .advertising
                    .set(AdType::ManufacturerData, vec![0x5A; 28])
            })
            .expect("28 data bytes should fit an empty store");

        let reply = dispatcher
            .dispatch(WidgetId::new(27), "Please advertise the TX power level.")
            .await;

        assert_eq!(WidgetReply::Deny, reply);
        let untouched = dispatcher
            .context()
            .stack
            .with(|stack| !stack.gap.advertising.contains(AdType::TxPower));
        assert!(untouched, "a rejected element must not linger in the store");
    }

    #[tokio::test]
    async fn a_discovered_peer_satisfies_the_presence_check() {
        let dispatcher = dispatcher_over(FakeIutConfig::default());
        let peer = scripted_peer();
        prime_target(dispatcher.context(), peer);
        dispatcher
            .context()
            .stack
            .with(|stack| stack.gap.discovery.record(peer, -44, Vec::new()));

        let reply = dispatcher
            .dispatch(WidgetId::new(10), "Please confirm IUT received advertising.")
            .await;
        assert_eq!(WidgetReply::Confirm, reply);
    }

    #[tokio::test(start_paused = true)]
    async fn an_unseen_peer_fails_the_presence_check() {
        let dispatcher = dispatcher_over(FakeIutConfig::default());
        prime_target(dispatcher.context(), scripted_peer());

        let reply = dispatcher
            .dispatch(WidgetId::new(10), "Please confirm IUT received advertising.")
            .await;
        assert_eq!(WidgetReply::Deny, reply);
    }

    #[tokio::test]
    async fn peer_absence_is_answered_after_stopping_discovery() {
        let dispatcher = dispatcher_over(FakeIutConfig::default());
        prime_target(dispatcher.context(), scripted_peer());

        let reply = dispatcher
            .dispatch(WidgetId::new(11), "Please confirm IUT did not receive it.")
            .await;
        assert_eq!(WidgetReply::Confirm, reply);
    }

    #[tokio::test]
    async fn a_verification_scan_reports_the_scripted_peer() {
        let record: FoundRecord = "public|001BDCF21C55|-42|-"
            .parse()
            .expect("fixture should parse");
        let dispatcher =
            dispatcher_over(FakeIutConfig::builder().found(vec![record]).build());
        prime_target(dispatcher.context(), scripted_peer());

        let reply = dispatcher
            .dispatch(
                WidgetId::new(138),
                "Please start device discovery and confirm the advertising report.",
            )
            .await;
        assert_eq!(WidgetReply::Confirm, reply);
    }

    #[tokio::test(start_paused = true)]
    async fn a_verification_scan_hearing_nothing_is_denied() {
        let dispatcher = dispatcher_over(FakeIutConfig::default());
        prime_target(dispatcher.context(), scripted_peer());

        let reply = dispatcher
            .dispatch(
                WidgetId::new(157),
                "Please confirm IUT received the advertising report.",
            )
            .await;
        assert_eq!(WidgetReply::Deny, reply);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_after_connecting_satisfies_the_no_link_check() {
        let dispatcher =
            dispatcher_over(FakeIutConfig::builder().unreachable(true).build());
        prime_target(dispatcher.context(), scripted_peer());

        let reply = dispatcher
            .dispatch(WidgetId::new(148), "Please confirm no connection.")
            .await;
        assert_eq!(WidgetReply::Confirm, reply);
    }

    #[tokio::test(start_paused = true)]
    async fn the_passkey_prompt_reports_digits_as_they_appear() {
        let dispatcher =
            dispatcher_over(FakeIutConfig::builder().passkey(915_425).build());
        let peer = scripted_peer();
        let context = dispatcher.context().clone();
        let pair = Pair { peer };

        let (reply, paired) = tokio::join!(
            dispatcher.dispatch(WidgetId::new(1002), "Please enter the displayed passkey."),
            context.client.send(&pair),
        );

        paired.expect("pairing should be acknowledged");
        assert_eq!(WidgetReply::Number(915_425), reply);
    }

    #[tokio::test]
    async fn handle_prompts_read_the_named_attribute() {
        let dispatcher = dispatcher_over(
            FakeIutConfig::builder()
                .read_value(vec![0xAB, 0xCD])
                .build(),
        );
        prime_target(dispatcher.context(), scripted_peer());

        let reply = dispatcher
            .dispatch(
                WidgetId::new(161),
                "Please confirm the value of handle 0x00EF.",
            )
            .await;
        assert_eq!(WidgetReply::Number(2), reply);
    }

    #[tokio::test]
    async fn a_read_prompt_without_a_handle_is_refused() {
        let context = fake_context(FakeIutConfig::default());
        prime_target(&context, scripted_peer());

        let result = read_attribute(context, "no attribute named here".to_owned()).await;
        assert_matches!(
            result,
            Err(WidError::Description {
                expected: "an attribute handle"
            })
        );
    }

    #[tokio::test]
    async fn the_uri_prompt_replaces_the_scan_response() {
        let dispatcher = dispatcher_over(FakeIutConfig::default());
        dispatcher
            .context()
            .stack
            .with(|stack| stack.gap.scan_response.set(AdType::NameFull, b"old".to_vec()))
            .expect("a short name should fit an empty store");

        let reply = dispatcher
            .dispatch(WidgetId::new(173), "Please advertise the URI record.")
            .await;

        assert_eq!(WidgetReply::Confirm, reply);
        dispatcher.context().stack.with(|stack| {
            assert!(!stack.gap.scan_response.contains(AdType::NameFull));
            assert_eq!(
                Some(b"\x17//example.org/".as_slice()),
                stack.gap.scan_response.get(AdType::Uri),
            );
        });
    }

    #[tokio::test]
    async fn tester_side_prompts_are_acknowledged() {
        let dispatcher = dispatcher_over(FakeIutConfig::default());
        let reply = dispatcher
            .dispatch(WidgetId::new(46), "Please start the Find Me procedure.")
            .await;
        assert_eq!(WidgetReply::Confirm, reply);
    }
}
