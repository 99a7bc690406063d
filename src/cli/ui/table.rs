use tabled::settings::Style as TableStyle;
use tabled::{Table, Tabled};

/// Renders typed rows as a rounded-border table, one column per field.
pub(crate) fn rounded<R: Tabled>(rows: impl IntoIterator<Item = R>) -> String {
    let mut table = Table::new(rows);
    table.with(TableStyle::rounded());
    table.to_string()
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use tabled::Tabled;

    use super::*;

    #[derive(Tabled)]
    struct VerdictLine {
        case: &'static str,
        verdict: &'static str,
    }

    #[test]
    fn rows_render_under_their_field_headers() {
        let rendered = rounded([
            VerdictLine {
                case: "GAP/ADV/BV-01-C",
                verdict: "pass",
            },
            VerdictLine {
                case: "GAP/CONN/GCEP/BV-01-C",
                verdict: "fail",
            },
        ]);

        assert_snapshot!(rendered, @r"
        ╭───────────────────────┬─────────╮
        │ case                  │ verdict │
        ├───────────────────────┼─────────┤
        │ GAP/ADV/BV-01-C       │ pass    │
        │ GAP/CONN/GCEP/BV-01-C │ fail    │
        ╰───────────────────────┴─────────╯
        ");
    }
}
