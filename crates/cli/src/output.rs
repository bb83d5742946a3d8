//! Terminal output formatting with rich UI support.

use std::time::Duration;

use console::{StyledObject, style};
use indicatif::{ProgressBar, ProgressStyle};
use palisade_core::PluginState;
use palisade_engine::{LoadReport, PluginStatus};

/// Prints a success message.
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Prints an error message.
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Prints a warning message.
pub fn warning(message: &str) {
    println!("{} {}", style("⚠").yellow().bold(), message);
}

/// Prints an info message.
pub fn info(message: &str) {
    println!("{} {}", style("ℹ").blue().bold(), message);
}

/// Prints a plugin that failed or was skipped.
pub fn plugin_failed(name: &str, reason: &str) {
    eprintln!("{} {} - {}", style("✗").red(), style(name).red(), reason);
}

/// Prints a skipped plugin directory.
pub fn plugin_skipped(dir: &str, reason: &str) {
    println!(
        "{} {} {}",
        style("○").dim(),
        style(dir).dim(),
        style(format!("({reason})")).dim()
    );
}

/// Prints the outcome of a boot.
pub fn load_summary(report: &LoadReport, duration_ms: u64) {
    for name in &report.loaded {
        println!("{} {}", style("✓").green(), name);
    }
    for (dir, reason) in &report.skipped {
        plugin_skipped(dir, reason);
    }
    for (name, reason) in &report.failed {
        plugin_failed(name, reason);
    }

    println!();
    if report.failed.is_empty() {
        println!(
            "{}: {} loaded in {} wave(s), {} skipped in {}ms",
            style("READY").green().bold(),
            report.loaded.len(),
            report.waves,
            report.skipped.len(),
            duration_ms
        );
    } else {
        println!(
            "{}: {} loaded, {} skipped, {} failed in {}ms",
            style("DEGRADED").yellow().bold(),
            report.loaded.len(),
            report.skipped.len(),
            report.failed.len(),
            duration_ms
        );
    }
}

/// Prints one row per plugin.
pub fn status_table(rows: &[PluginStatus]) {
    section_header("Plugins");
    for row in rows {
        let mut line = format!(
            "  {:<20} {:<10} {:<10} {}",
            row.name,
            row.version,
            row.mode,
            state_label(row.state)
        );
        if let Some(pid) = row.pid {
            line.push_str(&format!(" pid={pid}"));
        }
        if let Some(mb) = row.memory_mb {
            line.push_str(&format!(" rss={mb}MB"));
        }
        if row.restarts > 0 {
            line.push_str(&format!(" restarts={}", row.restarts));
        }
        if row.uptime_seconds > 0.0 {
            line.push_str(&format!(" up={:.0}s", row.uptime_seconds));
        }
        println!("{line}");
        if let Some(err) = &row.last_error {
            println!("    {}", style(err).dim());
        }
    }
}

fn state_label(state: PluginState) -> StyledObject<String> {
    let label = state.to_string();
    match state {
        PluginState::Running | PluginState::Ready => style(label).green(),
        PluginState::Failed => style(label).red(),
        PluginState::Restarting | PluginState::Reloading => style(label).yellow(),
        _ => style(label).dim(),
    }
}

/// Creates a spinner for long-running operations.
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Prints a header for a section.
pub fn section_header(title: &str) {
    println!("\n{}", style(format!("── {} ──", title)).bold());
}

/// Prints a list item.
pub fn list_item(text: &str) {
    println!("  {} {}", style("•").dim(), text);
}

/// Prints a key-value pair.
pub fn key_value(key: &str, value: &str) {
    println!("  {}: {}", style(key).dim(), value);
}
