//! Rate table inspection and amount quotes.

use tabled::{Table, Tabled, settings::Style};

use coinwall_core::rates::{best_for_amount, best_for_amount_greedy};
use coinwall_core::{AmountQuote, PointTier, RateQuote, RateTable, RateTier};

use crate::cli::{GlobalOpts, QuoteArgs};
use crate::error::CliError;
use crate::output;

// ── Table rows ──────────────────────────────────────────────────────

#[derive(Tabled)]
struct RateRow {
    #[tabled(rename = "Amount")]
    amount: u32,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Speed (down/up)")]
    speed: String,
    #[tabled(rename = "Pausable")]
    pausable: String,
}

impl From<&RateTier> for RateRow {
    fn from(t: &RateTier) -> Self {
        Self {
            amount: t.amount,
            time: output::format_secs(u64::from(t.minutes) * 60),
            speed: output::format_speed(t.download_speed, t.upload_speed),
            pausable: String::from(if t.is_pausable { "yes" } else { "no" }),
        }
    }
}

#[derive(Tabled)]
struct PointRow {
    #[tabled(rename = "Points")]
    points: u32,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Speed (down/up)")]
    speed: String,
}

impl From<&PointTier> for PointRow {
    fn from(t: &PointTier) -> Self {
        Self {
            points: t.points,
            time: output::format_secs(t.seconds()),
            speed: output::format_speed(t.download_speed, t.upload_speed),
        }
    }
}

fn rate_detail(table: &RateTable) -> String {
    if table.rates.is_empty() && table.point_rates.is_empty() {
        return "No rates configured. Run: coinwall config init".into();
    }
    let mut out = Table::new(table.rates.iter().map(RateRow::from))
        .with(Style::rounded())
        .to_string();
    if !table.point_rates.is_empty() {
        out.push_str("\n\n");
        out.push_str(
            &Table::new(table.point_rates.iter().map(PointRow::from))
                .with(Style::rounded())
                .to_string(),
        );
    }
    out
}

fn quote_line(q: &RateQuote) -> String {
    let tiers = q
        .tiers_used
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" + ");
    format!(
        "{} min, {} [{}]",
        q.minutes,
        output::format_speed(q.download_speed, q.upload_speed),
        if tiers.is_empty() { "-".into() } else { tiers }
    )
}

fn quote_detail(q: &AmountQuote) -> String {
    output::detail_lines(&[
        ("Amount", q.amount.to_string()),
        ("Preview", quote_line(&q.preview)),
        ("Credited", quote_line(&q.optimal)),
        ("Time", output::format_secs(q.optimal.seconds())),
    ])
}

// ── Handlers ────────────────────────────────────────────────────────

pub fn list(global: &GlobalOpts) -> Result<(), CliError> {
    let config = super::engine_config(global)?;
    let out = output::render_single(
        &global.output,
        &config.rates,
        rate_detail,
        |t| {
            t.rates
                .iter()
                .map(|r| format!("{}={}", r.amount, r.minutes))
                .collect::<Vec<_>>()
                .join("\n")
        },
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

pub fn quote(args: &QuoteArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = super::engine_config(global)?;
    let tiers = &config.rates.rates;
    let quote = AmountQuote {
        amount: args.amount,
        preview: best_for_amount_greedy(args.amount, tiers),
        optimal: best_for_amount(args.amount, tiers),
    };
    let out = output::render_single(&global.output, &quote, quote_detail, |q| {
        q.optimal.minutes.to_string()
    })?;
    output::print_output(&out, global.quiet);
    Ok(())
}
