//! Report generation
//!
//! Renders a [`SoakReport`] as plain text or JSON.

use crate::config::OutputFormat;
use crate::soak::SoakReport;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use trampoline_registry::BridgeStats;

/// Render the report in the requested format
pub fn render(report: &SoakReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Txt => Ok(render_txt(report)),
        OutputFormat::Json => {
            serde_json::to_string_pretty(report).context("Failed to serialize report")
        }
    }
}

/// Write the rendered report to `path`, or stdout when no path is given
pub fn write_report(report: &SoakReport, format: OutputFormat, path: Option<&Path>) -> Result<()> {
    let rendered = render(report, format)?;
    match path {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("Failed to write report: {:?}", path))?;
            log::info!("Report written to {:?}", path);
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn render_txt(report: &SoakReport) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_txt(&mut out, report);
    out
}

fn write_txt(out: &mut String, report: &SoakReport) -> std::fmt::Result {
    writeln!(out, "═══════════════════════════════════════════════")?;
    writeln!(out, "  Trampoline Registry - Soak Report")?;
    writeln!(out, "═══════════════════════════════════════════════")?;
    writeln!(out)?;
    writeln!(out, "Slot limit:          {}", report.slot_limit)?;
    writeln!(
        out,
        "Slot reclamation:    {}",
        if report.reclaim_slots { "enabled" } else { "disabled" }
    )?;
    writeln!(out, "Worker threads:      {}", report.threads)?;
    writeln!(out, "Elapsed:             {} ms", report.elapsed_ms)?;
    writeln!(out)?;
    writeln!(out, "Workload")?;
    writeln!(out, "───────────────────────────────────────────────")?;
    writeln!(out, "  Signal connections:  {}", report.signal_connections)?;
    writeln!(out, "  Refused connections: {}", report.refused_connections)?;
    writeln!(out, "  Sources scheduled:   {}", report.sources_scheduled)?;
    writeln!(out, "  Signal invocations:  {}", report.signal_invocations)?;
    writeln!(out, "  Source invocations:  {}", report.source_invocations)?;
    writeln!(out)?;
    write_stats(out, "Loaded", &report.loaded)?;
    write_stats(out, "After teardown", &report.after_teardown)?;
    writeln!(out, "Slot pool")?;
    writeln!(out, "───────────────────────────────────────────────")?;
    writeln!(
        out,
        "  Peak in use:         {} / {}",
        report.pool.peak_in_use, report.pool.limit
    )?;
    writeln!(out, "  Allocations:         {}", report.pool.allocations)?;
    writeln!(out, "  Releases:            {}", report.pool.releases)?;
    writeln!(out, "  Leaked slots:        {}", report.leaked_slots())?;
    writeln!(out)?;
    write!(
        out,
        "Result: {}",
        if report.is_clean() { "CLEAN" } else { "LEAKED STATE" }
    )
}

fn write_stats(out: &mut String, title: &str, stats: &BridgeStats) -> std::fmt::Result {
    writeln!(out, "{}", title)?;
    writeln!(out, "───────────────────────────────────────────────")?;
    writeln!(out, "  Live callbacks:      {}", stats.live_callbacks)?;
    writeln!(out, "  Handler mappings:    {}", stats.handler_mappings)?;
    writeln!(out, "  Source mappings:     {}", stats.source_mappings)?;
    writeln!(out, "  Outstanding sources: {}", stats.outstanding_sources)?;
    writeln!(
        out,
        "  Slots in use:        {} / {}",
        stats.slots_in_use, stats.slot_limit
    )?;
    writeln!(out)
}
