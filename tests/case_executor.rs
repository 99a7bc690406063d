use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use certbridge::{
    Barrier, ClientConfig, Executor, FakeIutConfig, FakeSessionFactory, Profile, Rendezvous,
    RolePlan, TestCase, Verdict, catalog, interaction, quiesce_radio, rendezvous_at,
    target_peer_from_pixit,
};

fn fake_executor(config: FakeIutConfig, synch: Rendezvous) -> Executor {
    let factory = FakeSessionFactory::new(config, Profile::Gap, ClientConfig::default(), synch);
    Executor::new(Arc::new(factory), CancellationToken::new())
}

#[tokio::test(start_paused = true)]
async fn the_full_catalogue_passes_against_the_scripted_iut() {
    let executor = fake_executor(FakeIutConfig::default(), Rendezvous::default());

    let report = executor.run(catalog()).await;

    let role_count: usize = catalog().iter().map(|case| case.plans.len()).sum();
    assert_eq!(role_count, report.reports.len());
    for case_report in &report.reports {
        assert_eq!(
            (Verdict::Pass, None),
            (case_report.verdict, case_report.cause.clone()),
            "case {} role {} should pass",
            case_report.case,
            case_report.role,
        );
    }
}

#[tokio::test(start_paused = true)]
async fn a_custom_two_role_case_meets_at_its_barrier() {
    let executor = fake_executor(FakeIutConfig::default(), Rendezvous::default());
    let case = TestCase::builder()
        .id("GAP/CROSS/CUSTOM/BV-01")
        .profile(Profile::Gap)
        .barriers(vec![Barrier::new("radio_ready", ["peripheral", "central"])])
        .plans(vec![
            RolePlan::builder()
                .role("peripheral")
                .run(vec![
                    interaction(21, "Please prepare IUT into connectable mode."),
                    rendezvous_at("radio_ready"),
                ])
                .teardown(vec![quiesce_radio()])
                .build(),
            RolePlan::builder()
                .role("central")
                .run(vec![
                    rendezvous_at("radio_ready"),
                    interaction(23, "Please start General Discovery."),
                ])
                .teardown(vec![quiesce_radio()])
                .build(),
        ])
        .build();

    let reports = executor.run_case(case).await;

    assert_eq!(2, reports.len());
    assert_eq!(Verdict::Pass, reports[0].verdict);
    assert_eq!(Verdict::Pass, reports[1].verdict);
}

#[tokio::test(start_paused = true)]
async fn an_unmet_barrier_times_out_and_fails_the_role() {
    let synch = Rendezvous::new(Duration::from_millis(50), CancellationToken::new());
    let executor = fake_executor(FakeIutConfig::default(), synch);
    let case = TestCase::builder()
        .id("GAP/CROSS/LONE/BV-01")
        .profile(Profile::Gap)
        .barriers(vec![Barrier::new("both_sides", ["solo", "absent"])])
        .plans(vec![
            RolePlan::builder()
                .role("solo")
                .run(vec![rendezvous_at("both_sides")])
                .build(),
        ])
        .build();

    let reports = executor.run_case(case).await;

    assert_eq!(1, reports.len());
    assert_eq!(Verdict::Fail, reports[0].verdict);
    let cause = reports[0]
        .cause
        .as_deref()
        .expect("a failed role should carry its cause");
    assert!(cause.contains("timed out"), "cause: {cause}");
}

#[tokio::test(start_paused = true)]
async fn verdict_counts_roll_up_in_the_run_summary() {
    let executor = fake_executor(FakeIutConfig::default(), Rendezvous::default());
    let passing = TestCase::builder()
        .id("GAP/DISC/NONM/BV-01-C")
        .profile(Profile::Gap)
        .plans(vec![
            RolePlan::builder()
                .role("iut")
                .run(vec![interaction(
                    5,
                    "Please prepare IUT into non-discoverable mode.",
                )])
                .teardown(vec![quiesce_radio()])
                .build(),
        ])
        .build();
    let failing = TestCase::builder()
        .id("GAP/RECV/NEG/BV-99")
        .profile(Profile::Gap)
        .plans(vec![
            RolePlan::builder()
                .role("iut")
                .setup(vec![target_peer_from_pixit()])
                .run(vec![interaction(
                    10,
                    "Please confirm IUT received the advertisement.",
                )])
                .build(),
        ])
        .build();

    let report = executor.run(vec![passing, failing]).await;

    let summary = report.summary();
    assert_eq!(1, summary.passed);
    assert_eq!(1, summary.failed);
    assert_eq!(0, summary.inconclusive);
}
