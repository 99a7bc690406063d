mod painter;
mod report_view;
mod table;

pub(crate) use self::painter::Painter;
pub(crate) use self::report_view::{CatalogView, PixitView, RunReportView};
