use std::io::{self, Write};

use crossterm::style::Stylize;
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, RunParameters, RunSummary};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Colored banner, progress lines on stderr and a recap on stdout.
pub struct ConsoleOutput;

impl ConsoleOutput {
    pub fn print_banner(parameters: &RunParameters) {
        let criteria = &parameters.criteria;
        println!("{}", "KIRA-DD dataset download".cyan().bold());
        println!("{}", "=".repeat(48).dark_grey());
        row("catalog", &parameters.catalog);
        row("components", &criteria.components.to_string());
        row("domains", &criteria.domains.to_string());
        row("subset", &scoped(criteria.subset));
        row("split", &scoped(criteria.split));
        row(
            "chunk",
            &format!("{} of {}", parameters.stripe.index(), parameters.stripe.total()),
        );
        row("dest", &parameters.dest);
        row("dest (compressed)", &parameters.dest_compressed);
        row("output structure", &parameters.output_structure);
        row("transfer", &parameters.transfer);
        row(
            "connections",
            &format!(
                "{} total, {} per server",
                parameters.budget.total(),
                parameters.budget.per_server()
            ),
        );
        row("workers", &parameters.pipeline.workers.to_string());
        row("max tries", &parameters.max_attempts.to_string());
        row("verify checksums", &parameters.verify_checksums.to_string());
        row("keep compressed", &parameters.pipeline.keep_compressed.to_string());
        row("only download", &parameters.pipeline.download_only.to_string());
        if parameters.pipeline.dry_run {
            println!("{}", "dry run: nothing will be downloaded".yellow());
        }
        println!("{}", "=".repeat(48).dark_grey());
    }

    pub fn print_recap(summary: &RunSummary) {
        let counts = &summary.counts;
        println!();
        println!("{}", "KIRA-DD summary".cyan().bold());
        println!("{}", format!("selected archives: {}", counts.selected).white());
        if counts.extracted > 0 {
            println!("{}", format!("extracted: {}", counts.extracted).green());
        }
        if counts.downloaded > 0 {
            println!("{}", format!("downloaded: {}", counts.downloaded).green());
        }
        if counts.already_present > 0 {
            println!(
                "{}",
                format!("already present: {}", counts.already_present).green()
            );
        }
        if counts.planned > 0 {
            println!("{}", format!("planned: {}", counts.planned).yellow());
        }

        if summary.failures.is_empty() {
            println!("{}", "failures: 0".green());
        } else {
            println!("{}", format!("failures: {}", summary.failures.len()).red().bold());
            for failure in &summary.failures {
                println!("{}", format!("  {} ({})", failure.label, failure.url).red());
                println!("{}", format!("    {}", failure.reason).dark_red());
            }
        }
        println!(
            "{}",
            format!("started {}  finished {}", summary.started_at, summary.finished_at)
                .dark_grey()
        );
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        let line = match event.elapsed {
            Some(elapsed) => format!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => event.message,
        };
        eprintln!("{} {line}", "»".cyan());
    }
}

fn row(label: &str, value: &str) {
    println!("{} {value}", format!("{label:>18}:").dark_grey());
}

fn scoped<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "all".to_string(), |value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::domain::Split;

    #[test]
    fn unscoped_values_render_as_all() {
        assert_eq!(scoped::<Split>(None), "all");
        assert_eq!(scoped(Some(Split::Val)), "val");
    }
}
