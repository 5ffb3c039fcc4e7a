use anyhow::Result;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use engine_api::dto::MatchMessage;
use rules_engine::RuleSet;

pub struct TermPrinted;

pub trait TermPrintable {
    fn term_print(&self) -> Result<TermPrinted>;
}

impl TermPrintable for RuleSet {
    fn term_print(&self) -> Result<TermPrinted> {
        let mut rules: Vec<_> = self.rules().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));

        let mut table = table();

        table.set_header(vec![
            Cell::new("RULE").add_attribute(Attribute::Bold),
            Cell::new("TYPE").add_attribute(Attribute::Bold),
            Cell::new("SEVERITY").add_attribute(Attribute::Bold),
            Cell::new("EXPRESSION").add_attribute(Attribute::Bold),
        ]);

        for rule in rules {
            let severity = rule.metadata.severity.as_deref().unwrap_or("-");
            let severity_color = match severity {
                "critical" | "high" => Color::Red,
                "medium" => Color::Yellow,
                _ => Color::White,
            };

            table.add_row(vec![
                Cell::new(&rule.id)
                    .fg(Color::Cyan)
                    .add_attribute(Attribute::Bold),
                Cell::new(rule.event_type),
                Cell::new(severity).fg(severity_color),
                Cell::new(&rule.expression),
            ]);
        }

        println!("{table}");
        println!("{} rules loaded", self.len());
        Ok(TermPrinted)
    }
}

impl TermPrintable for MatchMessage {
    fn term_print(&self) -> Result<TermPrinted> {
        println!("\x1b[1;31m{}\x1b[0m {:#}", self.rule_id, self.event);
        println!("  {}", self.rule_definition);
        Ok(TermPrinted)
    }
}

fn table() -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table
}
