//! Human and JSON rendering of command results.

use anyhow::Result;
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use serde_json::json;

use kiln_core::apply::{Action, StageResult};
use kiln_core::cluster::NamespaceInfo;
use kiln_core::error::KilnError;
use kiln_core::labels::PREVIEW_CREATED_ANNOTATION;
use kiln_core::pipeline::DeployReport;
use kiln_core::report::{ErrorEntry, MachineReport, to_json_document};
use kiln_core::revision::Revision;
use kiln_core::settings::OutputFormat;

/// Prints command results in the selected format. Human output goes to
/// stdout, diagnostics to stderr; JSON mode prints exactly one document.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    format: OutputFormat,
}

impl Printer {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    pub fn deploy_report(&self, report: &DeployReport) {
        if self.is_json() {
            println!("{}", MachineReport::from(report).to_json());
            return;
        }

        for result in &report.apply.results {
            print_result(result);
        }
        for result in &report.prune.results {
            print_result(result);
        }
        for skipped in &report.prune.skipped {
            println!(
                "  {} {:<40} {}",
                style("-").dim(),
                skipped.target.to_string(),
                style(format!("kept: {}", skipped.reason)).dim()
            );
        }

        let apply = &report.apply;
        println!();
        println!(
            "  {} created, {} updated, {} unchanged, {} failed in {:.1}s",
            apply.count(Action::Created),
            apply.count(Action::Updated),
            apply.count(Action::Unchanged),
            apply.count(Action::Failed),
            report.duration.as_secs_f64()
        );
        if let Some(to) = report.rolled_back_to {
            println!("  Rolled back to revision {}", to);
        }
        if let Some(revision) = report.revision {
            println!(
                "{} {} revision {} in {} ({})",
                style("✓").green().bold(),
                report.app,
                revision,
                report.namespace,
                report.context
            );
        } else if report.dry_run && report.success() {
            println!("{} dry run, nothing was written", style("·").cyan());
        }
        if let Some(error) = &report.error {
            self.error(error);
        }
    }

    pub fn error(&self, error: &KilnError) {
        if self.is_json() {
            let document = json!({"success": false, "error": ErrorEntry::from(error)});
            println!("{}", to_json_document(&document));
            return;
        }
        eprintln!("{} {}", style("✗").red().bold(), error);
        eprintln!("  {} {}", style("hint:").yellow(), error.hint());
    }

    pub fn history(&self, app: &str, revisions: &[Revision]) {
        if self.is_json() {
            let entries: Vec<_> = revisions
                .iter()
                .map(|r| {
                    json!({
                        "index": r.index,
                        "timestamp": r.timestamp.to_rfc3339(),
                        "author": r.author,
                        "fingerprint": r.fingerprint,
                        "summary": r.summary,
                    })
                })
                .collect();
            let document = json!({"app": app, "revisions": entries});
            println!("{}", to_json_document(&document));
            return;
        }

        if revisions.is_empty() {
            println!("No revisions recorded for {}", app);
            return;
        }
        println!(
            "  {:>5}  {:<20}  {:<12}  {}",
            "REV", "DEPLOYED", "FINGERPRINT", "AUTHOR"
        );
        println!("  {}", "-".repeat(70));
        for revision in revisions {
            println!(
                "  {:>5}  {:<20}  {:<12}  {}",
                revision.index,
                revision.timestamp.format("%Y-%m-%d %H:%M:%S"),
                &revision.fingerprint[..revision.fingerprint.len().min(12)],
                revision.author
            );
            for line in revision.summary.lines() {
                println!("         {}", style(line).dim());
            }
        }
    }

    pub fn previews(&self, app: &str, namespaces: &[NamespaceInfo]) {
        if self.is_json() {
            let entries: Vec<_> = namespaces
                .iter()
                .map(|ns| {
                    json!({
                        "namespace": ns.name,
                        "createdAt": ns.annotations.get(PREVIEW_CREATED_ANNOTATION),
                    })
                })
                .collect();
            let document = json!({"app": app, "previews": entries});
            println!("{}", to_json_document(&document));
            return;
        }
        if namespaces.is_empty() {
            println!("No previews for {}", app);
            return;
        }
        for ns in namespaces {
            let created = ns
                .annotations
                .get(PREVIEW_CREATED_ANNOTATION)
                .map(String::as_str)
                .unwrap_or("-");
            println!("  {:<40} {}", ns.name, style(created).dim());
        }
    }

    pub fn message(&self, text: &str) {
        if self.is_json() {
            println!("{}", to_json_document(&json!({"success": true, "message": text})));
        } else {
            println!("{} {}", style("✓").green().bold(), text);
        }
    }
}

fn print_result(result: &StageResult) {
    let glyph = match result.action {
        Action::Created => style("+").green().bold(),
        Action::Updated => style("~").yellow().bold(),
        Action::Unchanged => style("=").dim(),
        Action::Planned => style("·").cyan(),
        Action::Failed => style("✗").red().bold(),
        Action::Deleted => style("-").magenta().bold(),
    };
    println!(
        "  {} {:<40} {:<10} {:>6}ms",
        glyph,
        result.target.to_string(),
        result.action.as_str(),
        result.duration.as_millis()
    );
    if let Some(error) = &result.error {
        println!("      {}", style(error).red());
    }
}

/// Ask before a destructive action. Unattended sessions never confirm.
pub fn confirm(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    if !console::user_attended() {
        eprintln!("{} pass --yes to {}", style("!").yellow(), prompt.to_lowercase());
        return Ok(false);
    }
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmed)
}
