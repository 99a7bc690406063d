use std::io;

use anyhow::Result;
use serde::Serialize;

use crate::cli::command::{CatalogArgs, OutputFormat, PixitArgs, RunOptions};
use crate::cli::ui::{CatalogView, Painter, PixitView};
use crate::executor::{TestCase, catalog};
use crate::pixit::{PixitStore, Profile};

#[derive(Serialize)]
struct CatalogEntry<'a> {
    case: &'a str,
    profile: Profile,
    roles: Vec<&'a str>,
}

impl<'a> From<&'a TestCase> for CatalogEntry<'a> {
    fn from(case: &'a TestCase) -> Self {
        Self {
            case: &case.id,
            profile: case.profile,
            roles: case.plans.iter().map(|plan| plan.role.as_str()).collect(),
        }
    }
}

/// Executes the `catalog` command.
pub(crate) fn run<W>(args: &CatalogArgs, options: RunOptions, out: &mut W) -> Result<()>
where
    W: io::Write,
{
    let mut cases = catalog();
    if let Some(profile) = args.profile() {
        cases.retain(|case| case.profile == profile);
    }

    match options.format {
        OutputFormat::Json => {
            for case in &cases {
                writeln!(out, "{}", serde_json::to_string(&CatalogEntry::from(case))?)?;
            }
        }
        OutputFormat::Pretty => {
            write!(out, "{}", CatalogView::new(&cases))?;
        }
    }
    Ok(())
}

/// Executes the `pixit` command.
pub(crate) fn run_pixit<W>(args: &PixitArgs, options: RunOptions, out: &mut W) -> Result<()>
where
    W: io::Write,
{
    let store = PixitStore::for_profile(args.profile());
    match options.format {
        OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string(&store)?)?;
        }
        OutputFormat::Pretty => {
            let painter = Painter::new(options.interactive);
            write!(out, "{}", PixitView::new(&store, &painter))?;
        }
    }
    Ok(())
}
