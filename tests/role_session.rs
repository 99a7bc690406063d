use pretty_assertions::assert_eq;

use certbridge::{
    ClientConfig, CommandClient, FakeIutConfig, FoundRecord, PeerAddr, PixitStore, Profile,
    Rendezvous, Role, RoleSession, WidgetId, WidgetReply, gap_table, spawn_fake_iut,
};

fn session_over(config: FakeIutConfig) -> RoleSession {
    let transport = spawn_fake_iut(config);
    let client = CommandClient::spawn(transport, ClientConfig::default());
    RoleSession::new(
        Role::new("iut"),
        client,
        gap_table().expect("the gap table should build"),
        PixitStore::for_profile(Profile::Gap),
        Rendezvous::default(),
    )
}

#[tokio::test]
async fn bootstrap_reads_the_controller_identity_into_state() -> anyhow::Result<()> {
    let mut session = session_over(FakeIutConfig::default());
    session.bootstrap(Profile::Gap).await?;

    let identity = session
        .stack()
        .with(|stack| stack.gap.identity.clone())
        .expect("bootstrap should record the controller identity");
    assert_eq!("DEADBEEFDEAD", identity.addr.to_string());
    assert_eq!("fake-iut", identity.name);

    session.close().await;
    Ok(())
}

#[tokio::test]
async fn bootstrap_writes_the_controller_address_into_the_pixit_set() -> anyhow::Result<()> {
    let mut session = session_over(FakeIutConfig::default());
    session.bootstrap(Profile::Gap).await?;

    let addr = session
        .pixit()
        .with(|pixit| pixit.get("TSPX_bd_addr_iut").map(str::to_owned))?;
    assert_eq!("DEADBEEFDEAD", addr);

    session.close().await;
    Ok(())
}

#[tokio::test]
async fn prompts_are_answered_through_the_handler_table() -> anyhow::Result<()> {
    let mut session = session_over(FakeIutConfig::default());
    session.bootstrap(Profile::Gap).await?;

    let reply = session
        .answer(
            WidgetId::new(21),
            "Please prepare IUT into connectable mode and start advertising.",
        )
        .await;
    assert_eq!(WidgetReply::Confirm, reply);

    session.close().await;
    Ok(())
}

#[tokio::test]
async fn unknown_prompts_collapse_to_a_negative_answer() {
    let session = session_over(FakeIutConfig::default());

    let reply = session
        .answer(WidgetId::new(9999), "Please do something unheard of.")
        .await;
    assert_eq!(WidgetReply::Deny, reply);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn discovery_results_are_mirrored_for_the_presence_check() -> anyhow::Result<()> {
    let record: FoundRecord = "public|001BDCF21C55|-42|020106".parse()?;
    let peer: PeerAddr = "public|001BDCF21C55".parse()?;
    let config = FakeIutConfig::builder().found(vec![record]).build();
    let mut session = session_over(config);
    session.bootstrap(Profile::Gap).await?;
    session.stack().with(|stack| stack.gap.peer = Some(peer));

    let started = session
        .answer(WidgetId::new(23), "Please start General Discovery.")
        .await;
    assert_eq!(WidgetReply::Confirm, started);

    let reply = session
        .answer(
            WidgetId::new(10),
            "Please confirm IUT received the advertisement.",
        )
        .await;
    assert_eq!(WidgetReply::Confirm, reply);

    session.close().await;
    Ok(())
}

#[tokio::test]
async fn reset_restores_power_on_defaults() -> anyhow::Result<()> {
    let mut session = session_over(FakeIutConfig::default());
    session.bootstrap(Profile::Gap).await?;
    let peer: PeerAddr = "random|C0FFEEC0FFEE".parse()?;
    session.stack().with(|stack| stack.gap.peer = Some(peer));

    session.reset();

    session.stack().with(|stack| {
        assert_eq!(None, stack.gap.identity);
        assert_eq!(None, stack.gap.peer);
        assert!(stack.gap.discovery.is_empty());
    });

    session.close().await;
    Ok(())
}
