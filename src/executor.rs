//! Case execution: phased role workers, verdict grading and run reports.
//!
//! A [`TestCase`] scripts one or more [`RolePlan`]s. The executor opens a
//! session per role, walks each plan through setup, run and teardown, and
//! grades the role with a [`Verdict`]. Failures during setup leave the case
//! [`Verdict::Inconclusive`]; failures during the run body, including an
//! aborted run, grade it [`Verdict::Fail`]. Teardown is best effort and never
//! changes the grade.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use serde::Serialize;
use serde_with::SerializeDisplay;
use strum_macros::Display as StrumDisplay;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::addr::{AddrType, DeviceAddr, PeerAddr};
use crate::client::ClientError;
use crate::pixit::{PixitError, Profile};
use crate::proto::{StopAdvertising, StopDiscovery};
use crate::session::{RoleSession, SessionError, SessionFactory};
use crate::stack::StackError;
use crate::synch::{Role, SynchError};
use crate::wid::WidgetId;

/// Ceiling applied to each teardown step so a wedged IUT cannot stall the
/// run between cases.
const TEARDOWN_STEP_WINDOW: Duration = Duration::from_secs(5);

/// Lifecycle of one role inside a case, observable over [`RoleRun::phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Idle,
    SettingUp,
    Running,
    AwaitingVerdict,
    TornDown,
}

/// Grade assigned to one role of one case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, SerializeDisplay)]
#[strum(serialize_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A prompt was answered negatively, so the scripted flow cannot pass.
    #[error("wid {wid} answered negatively")]
    NegativeReply { wid: WidgetId },
    /// The run was cancelled while a step was in flight.
    #[error("run aborted")]
    Aborted,
    /// `TSPX_bd_addr_iut` did not decode to a six-octet address.
    #[error("TSPX_bd_addr_iut holds {len} bytes, expected 6")]
    BadPixitAddress { len: usize },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error(transparent)]
    Synch(#[from] SynchError),
    #[error(transparent)]
    Pixit(#[from] PixitError),
}

/// Future returned by one [`Action`] invocation. Borrows the session it was
/// handed for as long as it runs.
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ExecutorError>> + Send + 'a>>;

/// One scripted step of a role plan.
pub type Action = Arc<dyn for<'a> Fn(&'a RoleSession) -> ActionFuture<'a> + Send + Sync>;

fn action<F>(behave: F) -> Action
where
    F: for<'a> Fn(&'a RoleSession) -> ActionFuture<'a> + Send + Sync + 'static,
{
    Arc::new(behave)
}

fn boxed<'a, F>(future: F) -> ActionFuture<'a>
where
    F: Future<Output = Result<(), ExecutorError>> + Send + 'a,
{
    Box::pin(future)
}

/// An action that dispatches one prompt and requires a positive reply.
#[must_use]
pub fn interaction(wid: u16, description: &'static str) -> Action {
    action(move |session| boxed(require_positive(session, WidgetId::new(wid), description)))
}

async fn require_positive(
    session: &RoleSession,
    wid: WidgetId,
    description: &str,
) -> Result<(), ExecutorError> {
    let reply = session.answer(wid, description).await;
    if reply.is_positive() {
        Ok(())
    } else {
        Err(ExecutorError::NegativeReply { wid })
    }
}

/// An action that blocks at a named rendezvous point until every role of the
/// case has arrived there.
#[must_use]
pub fn rendezvous_at(point: &'static str) -> Action {
    action(move |session| boxed(arrive(session, point)))
}

async fn arrive(session: &RoleSession, point: &str) -> Result<(), ExecutorError> {
    session.rendezvous().arrive(point, session.role()).await?;
    Ok(())
}

/// An action that primes the peer address connection-oriented prompts target,
/// taken from `TSPX_bd_addr_iut`.
#[must_use]
pub fn target_peer_from_pixit() -> Action {
    action(|session| boxed(prime_target(session)))
}

async fn prime_target(session: &RoleSession) -> Result<(), ExecutorError> {
    let blob = session
        .pixit()
        .with(|pixit| pixit.get_hex("TSPX_bd_addr_iut"))?;
    let octets: [u8; 6] = blob
        .as_slice()
        .try_into()
        .map_err(|_wrong_len| ExecutorError::BadPixitAddress { len: blob.len() })?;
    let peer = PeerAddr::new(AddrType::Public, DeviceAddr::new(octets));
    session.stack().with(|stack| stack.gap.peer = Some(peer));
    Ok(())
}

/// A teardown action that stops advertising and discovery and resets the
/// mirrored state, leaving the IUT quiet for the next case.
#[must_use]
pub fn quiesce_radio() -> Action {
    action(|session| boxed(quiesce(session)))
}

async fn quiesce(session: &RoleSession) -> Result<(), ExecutorError> {
    session.client().send(&StopAdvertising).await?;
    session.client().send(&StopDiscovery).await?;
    session.reset();
    Ok(())
}

/// The steps one role performs in each phase of a case.
#[derive(Clone, Builder)]
pub struct RolePlan {
    #[builder(into)]
    pub role: Role,
    /// Runs during [`Phase::SettingUp`], after the session bootstrap.
    #[builder(default)]
    pub setup: Vec<Action>,
    /// The case body. Every step must succeed for a pass.
    #[builder(default)]
    pub run: Vec<Action>,
    /// Best-effort cleanup. Every step is attempted even after a failure.
    #[builder(default)]
    pub teardown: Vec<Action>,
}

/// A named rendezvous point and the roles expected to reach it.
#[derive(Debug, Clone)]
pub struct Barrier {
    pub point: String,
    pub roles: Vec<Role>,
}

impl Barrier {
    #[must_use]
    pub fn new(point: impl Into<String>, roles: impl IntoIterator<Item = impl Into<Role>>) -> Self {
        Self {
            point: point.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

/// One catalogued conformance case.
#[derive(Clone, Builder)]
pub struct TestCase {
    #[builder(into)]
    pub id: String,
    pub profile: Profile,
    /// Rendezvous points the case's roles meet at, defined before any role
    /// launches.
    #[builder(default)]
    pub barriers: Vec<Barrier>,
    pub plans: Vec<RolePlan>,
}

/// Outcome of one role of one case.
#[serde_with::serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub case: String,
    pub role: Role,
    pub verdict: Verdict,
    /// Cause of a non-pass grade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Wall-clock time from launch to teardown, in milliseconds on the wire.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub duration: Duration,
    /// Unix timestamp (seconds) of when the role settled.
    pub finished_at: i64,
}

/// Every role report of a run, in launch order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub reports: Vec<CaseReport>,
}

/// Verdict counts for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub inconclusive: usize,
}

impl RunReport {
    #[must_use]
    pub fn new(reports: Vec<CaseReport>) -> Self {
        Self { reports }
    }

    #[must_use]
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            passed: self.passed(),
            failed: self.failed(),
            inconclusive: self.inconclusive(),
        }
    }

    #[must_use]
    pub fn passed(&self) -> usize {
        self.count(Verdict::Pass)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(Verdict::Fail)
    }

    #[must_use]
    pub fn inconclusive(&self) -> usize {
        self.count(Verdict::Inconclusive)
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed() == 0 && self.inconclusive() == 0
    }

    fn count(&self, verdict: Verdict) -> usize {
        self.reports
            .iter()
            .filter(|report| report.verdict == verdict)
            .count()
    }
}

/// Handle to one launched role: watch its phase, await its report.
pub struct RoleRun {
    case: String,
    role: Role,
    phase: watch::Receiver<Phase>,
    handle: JoinHandle<CaseReport>,
}

impl RoleRun {
    /// A receiver that tracks the worker's current [`Phase`].
    #[must_use]
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Waits for the worker and returns its report. A worker that panicked
    /// is reported as a failure rather than propagated.
    pub async fn join(self) -> CaseReport {
        match self.handle.await {
            Ok(report) => report,
            Err(join_error) => {
                error!(error = %join_error, "role worker did not finish");
                CaseReport {
                    case: self.case,
                    role: self.role,
                    verdict: Verdict::Fail,
                    cause: Some("role worker panicked".to_owned()),
                    duration: Duration::ZERO,
                    finished_at: OffsetDateTime::now_utc().unix_timestamp(),
                }
            }
        }
    }
}

/// Drives catalogued cases to verdicts over sessions from one factory.
pub struct Executor {
    factory: Arc<dyn SessionFactory>,
    cancel: CancellationToken,
}

impl Executor {
    #[must_use]
    pub fn new(factory: Arc<dyn SessionFactory>, cancel: CancellationToken) -> Self {
        Self { factory, cancel }
    }

    /// Runs the cases in order. Cancellation stops the run between cases;
    /// the case in flight settles its own verdict first.
    pub async fn run(&self, cases: Vec<TestCase>) -> RunReport {
        let mut reports = Vec::new();
        for case in cases {
            if self.cancel.is_cancelled() {
                info!("run cancelled; remaining cases skipped");
                break;
            }
            reports.extend(self.run_case(case).await);
        }
        RunReport::new(reports)
    }

    /// Runs every role of one case concurrently and collects their reports.
    pub async fn run_case(&self, case: TestCase) -> Vec<CaseReport> {
        info!(case = %case.id, "case starting");
        let synch = self.factory.rendezvous();
        for barrier in &case.barriers {
            synch.define(barrier.point.clone(), barrier.roles.iter().cloned());
        }

        let mut runs = Vec::with_capacity(case.plans.len());
        for plan in case.plans {
            runs.push(self.launch_role(&case.id, case.profile, plan));
        }
        let mut reports = Vec::with_capacity(runs.len());
        for run in runs {
            let report = run.join().await;
            info!(
                case = %report.case,
                role = %report.role,
                verdict = %report.verdict,
                "role settled"
            );
            reports.push(report);
        }
        reports
    }

    /// Starts one role's worker. Used directly by callers that want to
    /// observe phases; [`Executor::run_case`] joins the handle itself.
    #[must_use]
    pub fn launch_role(&self, case_id: &str, profile: Profile, plan: RolePlan) -> RoleRun {
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let worker = RoleWorker {
            factory: Arc::clone(&self.factory),
            case: case_id.to_owned(),
            profile,
            plan,
            cancel: self.cancel.clone(),
            phase: phase_tx,
        };
        RoleRun {
            case: case_id.to_owned(),
            role: worker.plan.role.clone(),
            phase: phase_rx,
            handle: tokio::spawn(worker.run()),
        }
    }
}

struct RoleWorker {
    factory: Arc<dyn SessionFactory>,
    case: String,
    profile: Profile,
    plan: RolePlan,
    cancel: CancellationToken,
    phase: watch::Sender<Phase>,
}

impl RoleWorker {
    #[instrument(name = "case", skip(self), fields(id = %self.case, role = %self.plan.role))]
    async fn run(self) -> CaseReport {
        let started = Instant::now();
        let mut verdict = Verdict::Pass;
        let mut cause = None;

        self.advance(Phase::SettingUp);
        let mut session = match self.factory.open(&self.plan.role).await {
            Ok(session) => Some(session),
            Err(open_error) => {
                warn!(error = %open_error, "session did not open");
                verdict = Verdict::Inconclusive;
                cause = Some(open_error.to_string());
                None
            }
        };

        if let Some(session) = session.as_mut() {
            match self.set_up(session).await {
                Ok(()) => {
                    self.advance(Phase::Running);
                    if let Err(run_error) = self.drive(session).await {
                        verdict = Verdict::Fail;
                        cause = Some(run_error.to_string());
                    }
                }
                Err(ExecutorError::Aborted) => {
                    verdict = Verdict::Fail;
                    cause = Some(ExecutorError::Aborted.to_string());
                }
                Err(setup_error) => {
                    warn!(error = %setup_error, "setup failed; case is inconclusive");
                    verdict = Verdict::Inconclusive;
                    cause = Some(setup_error.to_string());
                }
            }

            self.advance(Phase::AwaitingVerdict);
            self.tear_down(session).await;
        }
        if let Some(session) = session.take() {
            session.close().await;
        }
        self.advance(Phase::TornDown);

        CaseReport {
            case: self.case.clone(),
            role: self.plan.role.clone(),
            verdict,
            cause,
            duration: started.elapsed(),
            finished_at: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    async fn set_up(&self, session: &mut RoleSession) -> Result<(), ExecutorError> {
        session.bootstrap(self.profile).await?;
        for step in &self.plan.setup {
            self.step(session, step).await?;
        }
        Ok(())
    }

    async fn drive(&self, session: &RoleSession) -> Result<(), ExecutorError> {
        for step in &self.plan.run {
            self.step(session, step).await?;
        }
        Ok(())
    }

    /// Attempts every teardown step, bounding each so a stuck IUT cannot
    /// hold the run hostage.
    async fn tear_down(&self, session: &RoleSession) {
        for step in &self.plan.teardown {
            match timeout(TEARDOWN_STEP_WINDOW, step(session)).await {
                Ok(Ok(())) => {}
                Ok(Err(teardown_error)) => warn!(error = %teardown_error, "teardown step failed"),
                Err(_elapsed) => warn!("teardown step timed out"),
            }
        }
    }

    async fn step(&self, session: &RoleSession, step: &Action) -> Result<(), ExecutorError> {
        tokio::select! {
            result = step(session) => result,
            () = self.cancel.cancelled() => Err(ExecutorError::Aborted),
        }
    }

    fn advance(&self, phase: Phase) {
        debug!(%phase, "phase");
        self.phase.send_replace(phase);
    }
}

/// The built-in GAP case catalogue.
#[must_use]
pub fn catalog() -> Vec<TestCase> {
    vec![
        TestCase::builder()
            .id("GAP/DISC/NONM/BV-01-C")
            .profile(Profile::Gap)
            .plans(vec![
                RolePlan::builder()
                    .role("iut")
                    .run(vec![interaction(
                        5,
                        "Please prepare IUT into non-discoverable and non-connectable mode and start advertising.",
                    )])
                    .teardown(vec![quiesce_radio()])
                    .build(),
            ])
            .build(),
        TestCase::builder()
            .id("GAP/DISC/GENM/BV-01-C")
            .profile(Profile::Gap)
            .plans(vec![
                RolePlan::builder()
                    .role("iut")
                    .run(vec![
                        interaction(122, "Please prepare IUT into general discoverable mode."),
                        interaction(24, "Please start advertising."),
                    ])
                    .teardown(vec![quiesce_radio()])
                    .build(),
            ])
            .build(),
        TestCase::builder()
            .id("GAP/BROB/BCST/BV-01-C")
            .profile(Profile::Gap)
            .plans(vec![
                RolePlan::builder()
                    .role("iut")
                    .run(vec![interaction(
                        51,
                        "Please send non-connectable undirected advertising with general discoverable flags.",
                    )])
                    .teardown(vec![quiesce_radio()])
                    .build(),
            ])
            .build(),
        TestCase::builder()
            .id("GAP/ADV/BV-01-C")
            .profile(Profile::Gap)
            .plans(vec![
                RolePlan::builder()
                    .role("iut")
                    .run(vec![interaction(
                        25,
                        "Please send advertising data with the Flags AD type.",
                    )])
                    .teardown(vec![quiesce_radio()])
                    .build(),
            ])
            .build(),
        TestCase::builder()
            .id("GAP/ADV/BV-03-C")
            .profile(Profile::Gap)
            .plans(vec![
                RolePlan::builder()
                    .role("iut")
                    .run(vec![interaction(
                        26,
                        "Please send advertising data with Manufacturer Specific Data.",
                    )])
                    .teardown(vec![quiesce_radio()])
                    .build(),
            ])
            .build(),
        TestCase::builder()
            .id("GAP/ADV/BV-10-C")
            .profile(Profile::Gap)
            .plans(vec![
                RolePlan::builder()
                    .role("iut")
                    .run(vec![interaction(
                        27,
                        "Please send advertising data with the TX Power Level AD type.",
                    )])
                    .teardown(vec![quiesce_radio()])
                    .build(),
            ])
            .build(),
        TestCase::builder()
            .id("GAP/CONN/GCEP/BV-01-C")
            .profile(Profile::Gap)
            .plans(vec![
                RolePlan::builder()
                    .role("iut")
                    .setup(vec![target_peer_from_pixit()])
                    .run(vec![
                        interaction(78, "Please initiate an ACL connection to the PTS."),
                        interaction(77, "Please disconnect from the PTS."),
                    ])
                    .teardown(vec![quiesce_radio()])
                    .build(),
            ])
            .build(),
        TestCase::builder()
            .id("GAP/BOND/NBON/BV-01-C")
            .profile(Profile::Gap)
            .plans(vec![
                RolePlan::builder()
                    .role("iut")
                    .setup(vec![target_peer_from_pixit()])
                    .run(vec![
                        interaction(78, "Please initiate an ACL connection to the PTS."),
                        interaction(108, "Please start the pairing process."),
                        interaction(135, "Please remove the bonding information."),
                        interaction(77, "Please disconnect from the PTS."),
                    ])
                    .teardown(vec![quiesce_radio()])
                    .build(),
            ])
            .build(),
        TestCase::builder()
            .id("GAP/CROSS/ADV-SCAN/BV-01")
            .profile(Profile::Gap)
            .barriers(vec![Barrier::new("adv_ready", ["advertiser", "scanner"])])
            .plans(vec![
                RolePlan::builder()
                    .role("advertiser")
                    .run(vec![
                        interaction(
                            21,
                            "Please prepare IUT into connectable mode and start advertising.",
                        ),
                        rendezvous_at("adv_ready"),
                    ])
                    .teardown(vec![quiesce_radio()])
                    .build(),
                RolePlan::builder()
                    .role("scanner")
                    .run(vec![
                        rendezvous_at("adv_ready"),
                        interaction(23, "Please start general discovery over LE."),
                    ])
                    .teardown(vec![quiesce_radio()])
                    .build(),
            ])
            .build(),
    ]
}
