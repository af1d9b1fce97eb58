//! Output formatting: table, JSON, YAML, plain.
//!
//! Table uses `tabled`, structured formats use serde, plain emits one
//! identifier per line.

use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use owo_colors::OwoColorize;
use tabled::{Table, Tabled, settings::Style};

use coinwall_core::SessionState;

use crate::cli::{ColorMode, OutputFormat};
use crate::error::CliError;

// ── Color helpers ────────────────────────────────────────────────────

pub fn should_color(mode: &ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

/// Session state label, colored when `color` is set.
pub fn state_label(state: SessionState, color: bool) -> String {
    let label = state.to_string();
    if !color {
        return label;
    }
    match state {
        SessionState::Active => label.green().to_string(),
        SessionState::Paused => label.yellow().to_string(),
        SessionState::Expired => label.red().to_string(),
        SessionState::Offline => label.dimmed().to_string(),
    }
}

// ── Value formatting ─────────────────────────────────────────────────

pub fn format_secs(secs: u64) -> String {
    if secs == 0 {
        return "0s".into();
    }
    humantime::format_duration(Duration::from_secs(secs)).to_string()
}

/// `down/up` in kbps, or "unlimited" when neither is shaped.
pub fn format_speed(download: u32, upload: u32) -> String {
    if download == 0 && upload == 0 {
        "unlimited".into()
    } else {
        format!("{download}/{upload} kbps")
    }
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render a list of serde-serializable + tabled items in the chosen format.
pub fn render_list<T, R>(
    format: &OutputFormat,
    data: &[T],
    to_row: impl Fn(&T) -> R,
    id_fn: impl Fn(&T) -> String,
) -> Result<String, CliError>
where
    T: serde::Serialize,
    R: Tabled,
{
    match format {
        OutputFormat::Table => {
            let rows: Vec<R> = data.iter().map(to_row).collect();
            Ok(render_table(&rows))
        }
        OutputFormat::Json => Ok(serde_json::to_string_pretty(data)?),
        OutputFormat::JsonCompact => Ok(serde_json::to_string(data)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(data)?),
        OutputFormat::Plain => Ok(data.iter().map(&id_fn).collect::<Vec<_>>().join("\n")),
    }
}

/// Render a single item. Tables use `detail_fn` for a key/value view.
pub fn render_single<T>(
    format: &OutputFormat,
    data: &T,
    detail_fn: impl Fn(&T) -> String,
    id_fn: impl Fn(&T) -> String,
) -> Result<String, CliError>
where
    T: serde::Serialize,
{
    match format {
        OutputFormat::Table => Ok(detail_fn(data)),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(data)?),
        OutputFormat::JsonCompact => Ok(serde_json::to_string(data)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(data)?),
        OutputFormat::Plain => Ok(id_fn(data)),
    }
}

/// Aligned `key: value` lines for detail views.
pub fn detail_lines(pairs: &[(&str, String)]) -> String {
    let width = pairs.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    pairs
        .iter()
        .map(|(k, v)| format!("{k:<width$}  {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

fn render_table<R: Tabled>(rows: &[R]) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_render_human_readable() {
        assert_eq!(format_secs(0), "0s");
        assert_eq!(format_secs(90), "1m 30s");
        assert_eq!(format_secs(7200), "2h");
    }

    #[test]
    fn unshaped_sessions_read_unlimited() {
        assert_eq!(format_speed(0, 0), "unlimited");
        assert_eq!(format_speed(5120, 2048), "5120/2048 kbps");
    }

    #[test]
    fn detail_keys_are_aligned() {
        let text = detail_lines(&[("MAC", "aa".into()), ("Remaining", "1m".into())]);
        assert_eq!(text, "MAC        aa\nRemaining  1m");
    }

    #[test]
    fn plain_list_is_one_id_per_line() {
        #[derive(serde::Serialize)]
        struct Item(u32);
        #[derive(Tabled)]
        struct Row {
            n: u32,
        }
        let out = render_list(
            &OutputFormat::Plain,
            &[Item(1), Item(2)],
            |i| Row { n: i.0 },
            |i| i.0.to_string(),
        )
        .unwrap_or_default();
        assert_eq!(out, "1\n2");
    }
}
