//! Session and sales ledger commands against the state file.

use std::time::Duration;

use bytesize::ByteSize;
use tabled::Tabled;

use coinwall_core::{Redemption, SaleRecord, Session, SessionStore};

use crate::cli::{GlobalOpts, SessionsArgs, SessionsCommand};
use crate::error::CliError;
use crate::output;

// ── Table rows ──────────────────────────────────────────────────────

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "MAC")]
    mac: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Remaining")]
    remaining: String,
    #[tabled(rename = "Speed (down/up)")]
    speed: String,
    #[tabled(rename = "Points")]
    points: u64,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Code")]
    code: String,
}

fn session_row(s: &Session, color: bool) -> SessionRow {
    SessionRow {
        mac: s.mac.to_string(),
        state: output::state_label(s.state(), color),
        remaining: output::format_secs(s.time_remaining),
        speed: output::format_speed(s.download_speed, s.upload_speed),
        points: s.points_balance,
        ip: s.ip.map(|ip| ip.to_string()).unwrap_or_default(),
        code: s.user_code.clone(),
    }
}

fn session_detail(s: &Session, color: bool) -> String {
    let opt = |v: Option<String>| v.unwrap_or_else(|| "-".into());
    output::detail_lines(&[
        ("MAC", s.mac.to_string()),
        ("State", output::state_label(s.state(), color)),
        ("Remaining", output::format_secs(s.time_remaining)),
        ("Total time", output::format_secs(s.total_time)),
        ("Speed", output::format_speed(s.download_speed, s.upload_speed)),
        ("Points", s.points_balance.to_string()),
        ("Pausable", s.pausable.to_string()),
        ("IP", opt(s.ip.map(|ip| ip.to_string()))),
        ("Interface", opt(s.interface.clone())),
        ("User code", s.user_code.clone()),
        ("Last active", s.last_activity().to_rfc3339()),
        ("Data up", ByteSize(s.total_data_up).to_string()),
        ("Data down", ByteSize(s.total_data_down).to_string()),
        ("Created", s.created_at.to_rfc3339()),
    ])
}

#[derive(Tabled)]
struct SaleRow {
    #[tabled(rename = "Recorded")]
    recorded: String,
    #[tabled(rename = "MAC")]
    mac: String,
    #[tabled(rename = "Channel")]
    channel: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Amount")]
    amount: u32,
}

impl From<&SaleRecord> for SaleRow {
    fn from(s: &SaleRecord) -> Self {
        Self {
            recorded: s.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            mac: s.mac.to_string(),
            channel: s.channel.to_string(),
            source: s.source.clone(),
            amount: s.amount,
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Read-only view of the state file. Works while the daemon holds it.
fn open_store(global: &GlobalOpts) -> Result<SessionStore, CliError> {
    let config = super::engine_config(global)?;
    let path = config.state_file.ok_or(CliError::NoStateFile)?;
    Ok(SessionStore::read_snapshot(&path)?)
}

fn not_found(mac: &str) -> CliError {
    CliError::NotFound {
        resource_type: "session".into(),
        identifier: mac.into(),
        list_command: "sessions list".into(),
    }
}

// ── Handlers ────────────────────────────────────────────────────────

pub async fn handle(args: SessionsArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let color = output::should_color(&global.color);
    match args.command {
        SessionsCommand::List(list) => {
            let mut sessions = open_store(global)?.snapshot();
            if list.active {
                sessions.retain(|s| s.time_remaining > 0);
            }
            sessions.sort_by(|a, b| a.mac.as_str().cmp(b.mac.as_str()));
            let out = output::render_list(
                &global.output,
                &sessions,
                |s| session_row(s, color),
                |s| s.mac.to_string(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        SessionsCommand::Show { mac } => {
            let key = super::parse_mac(&mac)?;
            let session = open_store(global)?.get(&key).ok_or_else(|| not_found(&mac))?;
            let out = output::render_single(
                &global.output,
                &session,
                |s| session_detail(s, color),
                |s| s.time_remaining.to_string(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        SessionsCommand::Credit {
            mac,
            time,
            download,
            upload,
        } => {
            let key = super::parse_mac(&mac)?;
            let engine = super::offline_engine(global)?;
            let session = engine
                .credit_time(&key, time.as_secs(), download, upload)
                .await?;
            engine.flush().await?;
            let out = output::render_single(
                &global.output,
                &session,
                |s| session_detail(s, color),
                |s| s.time_remaining.to_string(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        SessionsCommand::Redeem { mac, points } => {
            let key = super::parse_mac(&mac)?;
            let engine = super::offline_engine(global)?;
            let redemption = engine.redeem_points(&key, points).await?;
            engine.flush().await?;
            let out = output::render_single(
                &global.output,
                &redemption,
                redemption_detail,
                |r| r.seconds_added.to_string(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }
    }
}

fn redemption_detail(r: &Redemption) -> String {
    output::detail_lines(&[
        ("MAC", r.mac.to_string()),
        ("Points used", r.points_used.to_string()),
        (
            "Time added",
            humantime::format_duration(Duration::from_secs(r.seconds_added)).to_string(),
        ),
        ("Balance", r.points_balance.to_string()),
    ])
}

pub fn sales(global: &GlobalOpts) -> Result<(), CliError> {
    let sales = open_store(global)?.sales();
    let out = output::render_list(
        &global.output,
        &sales,
        |s| SaleRow::from(s),
        |s| format!("{}\t{}\t{}", s.mac, s.source, s.amount),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coinwall_core::{MacAddress, SessionState};

    #[test]
    fn row_shows_state_and_remaining_time() {
        let mut s = Session::new(MacAddress::new("AA-BB-CC-DD-EE-01"), Utc::now());
        s.is_connected = true;
        s.time_remaining = 3600;
        let row = session_row(&s, false);
        assert_eq!(row.mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(row.state, SessionState::Active.to_string());
        assert_eq!(row.remaining, "1h");
        assert_eq!(row.speed, "unlimited");
    }
}
