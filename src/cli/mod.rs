pub(crate) mod catalog;
pub(crate) mod command;
pub(crate) mod run;
pub(crate) mod ui;

pub use self::command::{
    Args, Backend, CatalogArgs, Command, FakeArgs, LogLevel, OutputFormat, PixitArgs, RunArgs,
    RunOptions,
};
