//! Parser for par2 tool output
//!
//! Each line of the tool's stdout maps to at most one [`ProgressLine`]. The
//! patterns are defined once, versioned, and tested against captured
//! par2cmdline transcripts; a final report is accumulated from the parsed
//! lines plus the exit status.

use super::traits::{RepairOutcome, RepairReport, VerifyReport};
use regex::Regex;
use std::sync::LazyLock;

/// Bump when the recognized output grammar changes
pub const PAR2_PATTERN_VERSION: u32 = 1;

#[allow(clippy::expect_used)]
static RE_LOADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^Loading "(?P<file>[^"]+)"\.?"#).expect("static regex")
});

#[allow(clippy::expect_used)]
static RE_VERIFYING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:Verifying|Scanning): ?(?P<done>\d+)[/ of]+(?P<total>\d+)").expect("static regex")
});

#[allow(clippy::expect_used)]
static RE_REPAIRING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Repairing: ?(?P<pct>\d+(?:\.\d+)?)%").expect("static regex")
});

#[allow(clippy::expect_used)]
static RE_NEED_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[Nn]eed (?P<blocks>\d+) more recovery blocks?").expect("static regex")
});

#[allow(clippy::expect_used)]
static RE_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^Target: "(?P<file>[^"]+)" - (?P<state>missing|damaged|found|repaired)"#)
        .expect("static regex")
});

#[allow(clippy::expect_used)]
static RE_BLOCK_COUNTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[Ff]ound (?P<found>\d+) of (?P<total>\d+) data blocks").expect("static regex")
});

#[allow(clippy::expect_used)]
static RE_RECOVERY_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[Yy]ou have (?P<blocks>\d+) recovery blocks? available").expect("static regex")
});

/// One structured line of par2 output
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    /// `Loading "set.par2"`
    Loading(String),
    /// `Verifying: 12/40` style progress
    Verifying {
        /// Files verified so far
        done: u32,
        /// Total files
        total: u32,
    },
    /// `Repairing: 37.5%`
    Repairing(f32),
    /// `You need 12 more recovery blocks to be able to repair`
    NeedBlocks(u32),
    /// `Target: "file" - missing.`
    TargetMissing(String),
    /// `Target: "file" - damaged.`
    TargetDamaged(String),
    /// `Target: "file" - found.`
    TargetFound(String),
    /// `Found 1999 of 2000 data blocks`
    BlockCounts {
        /// Intact data blocks found
        found: u32,
        /// Total data blocks in the set
        total: u32,
    },
    /// `You have 577 recovery blocks available`
    RecoveryBlocks(u32),
    /// `Repair is required.`
    RepairRequired,
    /// `Repair complete.`
    RepairComplete,
    /// `Repair is not possible.`
    RepairNotPossible,
    /// `All files are correct, repair is not needed.`
    AllCorrect,
}

/// Parse every fact carried by one line of par2 output.
///
/// A `Target: "x" - damaged. Found 10 of 20 data blocks.` line carries both
/// the target state and the block counts; accumulation needs them all, while
/// the progress stream only wants the primary fact from [`parse_line`].
pub(super) fn parse_line_all(line: &str) -> Vec<ProgressLine> {
    let mut facts = Vec::new();
    if let Some(primary) = parse_line(line) {
        facts.push(primary);
    }
    let trimmed = line.trim_end_matches(['\r', '.']).trim();
    if RE_TARGET.is_match(trimmed) {
        if let Some(caps) = RE_BLOCK_COUNTS.captures(trimmed) {
            if let (Ok(found), Ok(total)) = (caps["found"].parse(), caps["total"].parse()) {
                facts.push(ProgressLine::BlockCounts { found, total });
            }
        }
    }
    facts
}

/// Parse one line of par2 output into a structured progress line.
///
/// Lines outside the recognized grammar return None and are ignored.
pub fn parse_line(line: &str) -> Option<ProgressLine> {
    let line = line.trim_end_matches(['\r', '.']).trim();

    if let Some(caps) = RE_TARGET.captures(line) {
        let file = caps["file"].to_string();
        return Some(match &caps["state"] {
            "missing" => ProgressLine::TargetMissing(file),
            "damaged" => ProgressLine::TargetDamaged(file),
            "repaired" => ProgressLine::TargetFound(file),
            _ => ProgressLine::TargetFound(file),
        });
    }
    if let Some(caps) = RE_LOADING.captures(line) {
        return Some(ProgressLine::Loading(caps["file"].to_string()));
    }
    if let Some(caps) = RE_REPAIRING.captures(line) {
        return caps["pct"]
            .parse::<f32>()
            .ok()
            .map(ProgressLine::Repairing);
    }
    if let Some(caps) = RE_VERIFYING.captures(line) {
        let done = caps["done"].parse().ok()?;
        let total = caps["total"].parse().ok()?;
        return Some(ProgressLine::Verifying { done, total });
    }
    if let Some(caps) = RE_NEED_BLOCKS.captures(line) {
        return caps["blocks"]
            .parse::<u32>()
            .ok()
            .map(ProgressLine::NeedBlocks);
    }
    if let Some(caps) = RE_BLOCK_COUNTS.captures(line) {
        let found = caps["found"].parse().ok()?;
        let total = caps["total"].parse().ok()?;
        return Some(ProgressLine::BlockCounts { found, total });
    }
    if let Some(caps) = RE_RECOVERY_BLOCKS.captures(line) {
        return caps["blocks"]
            .parse::<u32>()
            .ok()
            .map(ProgressLine::RecoveryBlocks);
    }
    if line.starts_with("Repair is required") {
        return Some(ProgressLine::RepairRequired);
    }
    if line.starts_with("Repair complete") {
        return Some(ProgressLine::RepairComplete);
    }
    if line.starts_with("Repair is not possible") {
        return Some(ProgressLine::RepairNotPossible);
    }
    if line.starts_with("All files are correct") {
        return Some(ProgressLine::AllCorrect);
    }
    None
}

/// Build a verification report from the parsed lines and the exit status
pub(super) fn accumulate_verify(lines: &[ProgressLine], exit_ok: bool) -> VerifyReport {
    let mut report = VerifyReport::default();
    let mut found_blocks: Option<(u32, u32)> = None;

    for line in lines {
        match line {
            ProgressLine::TargetDamaged(file) => {
                if !report.damaged_files.contains(file) {
                    report.damaged_files.push(file.clone());
                }
            }
            ProgressLine::TargetMissing(file) => {
                if !report.missing_files.contains(file) {
                    report.missing_files.push(file.clone());
                }
            }
            ProgressLine::BlockCounts { found, total } => {
                found_blocks = Some((*found, *total));
            }
            ProgressLine::RecoveryBlocks(blocks) => report.recovery_blocks = *blocks,
            ProgressLine::NeedBlocks(blocks) => report.needed_blocks = *blocks,
            _ => {}
        }
    }

    if let Some((found, total)) = found_blocks {
        report.damaged_blocks = total.saturating_sub(found);
    }

    report.all_intact = exit_ok
        && report.damaged_blocks == 0
        && report.missing_files.is_empty()
        && report.damaged_files.is_empty();
    report.repairable = !report.all_intact
        && report.needed_blocks == 0
        && (report.damaged_blocks > 0
            || !report.missing_files.is_empty()
            || !report.damaged_files.is_empty())
        && report.recovery_blocks > 0;
    report
}

/// Build a repair report from the parsed lines and the exit status
pub(super) fn accumulate_repair(lines: &[ProgressLine], exit_ok: bool) -> RepairReport {
    let mut repaired_files = Vec::new();
    let mut needed = None;
    let mut not_possible = false;
    let mut complete = false;
    let mut all_correct = false;

    for line in lines {
        match line {
            ProgressLine::TargetFound(file) => {
                if !repaired_files.contains(file) {
                    repaired_files.push(file.clone());
                }
            }
            ProgressLine::NeedBlocks(blocks) => needed = Some(*blocks),
            ProgressLine::RepairNotPossible => not_possible = true,
            ProgressLine::RepairComplete => complete = true,
            ProgressLine::AllCorrect => all_correct = true,
            _ => {}
        }
    }

    let outcome = if complete || all_correct || (exit_ok && !not_possible && needed.is_none()) {
        RepairOutcome::Ok
    } else if let Some(blocks) = needed {
        RepairOutcome::NeedsMoreBlocks(blocks)
    } else {
        RepairOutcome::Damaged("repair is not possible".to_string())
    };

    RepairReport {
        outcome,
        repaired_files,
    }
}
