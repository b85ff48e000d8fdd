use crate::color::do_color;
use crate::record::Record;
use crate::space::ConfigSpace;
use crate::utils::join_into_string;

use itertools::Itertools;
use prettytable::{self, format, row, Cell, Row};

pub fn space_string(space: &ConfigSpace) -> String {
    format!("{}", space_table(space))
}

/// Pretty-print the `top` fastest error-free records to stdout.
pub fn pprint_history(records: &[Record], top: usize) {
    history_table(records, top).printstd()
}

pub fn history_string(records: &[Record], top: usize) -> String {
    format!("{}", history_table(records, top))
}

fn space_table(space: &ConfigSpace) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["#", "Knob", "Extent", "Outputs", "Candidates"]);
    for (i, (name, knob)) in space.knobs().enumerate() {
        table.add_row(row![
            i,
            name,
            knob.extent,
            knob.options.num_outputs,
            join_into_string(knob.entities.iter(), " ")
        ]);
    }
    table.add_row(row!["", "total", "", "", space.len()]);
    table.set_format(plain_format());
    table
}

fn history_table(records: &[Record], top: usize) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["Rank", "Workload", "Index", "Config", "Mean (ms)"]);
    let ranked = records
        .iter()
        .filter_map(|r| r.mean_cost().map(|c| (r, c)))
        .sorted_by(|a, b| a.1.total_cmp(&b.1))
        .take(top);
    for (rank, (record, cost)) in ranked.enumerate() {
        let config = join_into_string(
            record
                .config
                .entity
                .iter()
                .map(|(name, f)| format!("{name}={}", join_into_string(f, "x"))),
            " ",
        );
        let mut cost_cell = Cell::new(&format!("{:.4}", cost * 1e3));
        if rank == 0 && do_color() {
            cost_cell = cost_cell.style_spec("Fgb");
        }
        table.add_row(Row::new(vec![
            Cell::new(&(rank + 1).to_string()),
            Cell::new(&record.workload_key()),
            Cell::new(&record.config.index.to_string()),
            Cell::new(&config),
            cost_cell,
        ]));
    }
    table.set_format(plain_format());
    table
}

fn plain_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}
