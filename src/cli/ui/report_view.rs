use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use tabled::Tabled;

use crate::executor::{CaseReport, RunReport, TestCase, Verdict};
use crate::pixit::PixitStore;

use super::painter::Painter;
use super::table;

/// Renders a run's verdicts as a table followed by a one-line summary.
pub(crate) struct RunReportView<'a> {
    report: &'a RunReport,
    painter: &'a Painter,
}

/// One verdict line; field names double as column headers.
#[derive(Tabled)]
struct VerdictRow {
    case: String,
    role: String,
    verdict: String,
    duration: String,
    cause: String,
}

impl<'a> RunReportView<'a> {
    pub(crate) fn new(report: &'a RunReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }

    fn verdict_cell(&self, verdict: Verdict) -> String {
        let name = verdict.to_string();
        match verdict {
            Verdict::Pass => self.painter.pass(name),
            Verdict::Fail => self.painter.fail(name),
            Verdict::Inconclusive => self.painter.caution(name),
        }
    }

    fn row(&self, report: &CaseReport) -> VerdictRow {
        // Sub-millisecond noise adds nothing to a human-facing report.
        let duration = Duration::from_millis(report.duration.as_millis() as u64);
        VerdictRow {
            case: report.case.clone(),
            role: report.role.to_string(),
            verdict: self.verdict_cell(report.verdict),
            duration: humantime::format_duration(duration).to_string(),
            cause: report.cause.clone().unwrap_or_default(),
        }
    }
}

impl Display for RunReportView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let rows = self.report.reports.iter().map(|report| self.row(report));
        let summary = self.report.summary();
        writeln!(f, "{}", table::rounded(rows))?;
        writeln!(
            f,
            "{} passed, {} failed, {} inconclusive",
            summary.passed, summary.failed, summary.inconclusive
        )
    }
}

/// Renders the case catalogue as a table.
pub(crate) struct CatalogView<'a> {
    cases: &'a [TestCase],
}

impl<'a> CatalogView<'a> {
    pub(crate) fn new(cases: &'a [TestCase]) -> Self {
        Self { cases }
    }
}

#[derive(Tabled)]
struct CatalogRow {
    case: String,
    profile: String,
    roles: String,
}

impl Display for CatalogView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let rows = self.cases.iter().map(|case| {
            let roles: Vec<&str> = case.plans.iter().map(|plan| plan.role.as_str()).collect();
            CatalogRow {
                case: case.id.clone(),
                profile: case.profile.to_string(),
                roles: roles.join(" + "),
            }
        });
        writeln!(f, "{}", table::rounded(rows))
    }
}

/// Renders a profile's PIXIT defaults as a key/value table.
pub(crate) struct PixitView<'a> {
    store: &'a PixitStore,
    painter: &'a Painter,
}

impl<'a> PixitView<'a> {
    pub(crate) fn new(store: &'a PixitStore, painter: &'a Painter) -> Self {
        Self { store, painter }
    }
}

#[derive(Tabled)]
struct ParameterRow {
    parameter: String,
    value: String,
}

impl Display for PixitView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let heading = self
            .painter
            .heading(format!("PIXIT defaults for {}", self.store.profile()));
        let rows = self.store.entries().map(|(key, value)| ParameterRow {
            parameter: self.painter.muted(key),
            value: value.to_owned(),
        });
        writeln!(f, "{heading}")?;
        writeln!(f, "{}", table::rounded(rows))
    }
}
