//! Trigger table parsing: `category@offset` entries such as
//! `odds_fetch@-72h` or `results_fetch@+4h`.

use anyhow::{bail, Context, Result};
use chrono::Duration;

use crate::db::models::{TriggerCategory, TriggerDefinition};

/// Offsets beyond this are treated as typos.
const MAX_OFFSET_DAYS: i64 = 366;

/// Parse a signed offset like `-72h`, `+4h`, `+90m`, `-1d` or `+30s`.
pub fn parse_offset(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (sign, rest) = if let Some(rest) = s.strip_prefix('-') {
        (-1, rest)
    } else if let Some(rest) = s.strip_prefix('+') {
        (1, rest)
    } else {
        bail!("offset '{s}' must start with '+' or '-'");
    };
    let Some((split, unit)) = rest.char_indices().last() else {
        bail!("offset '{s}' is missing a magnitude or unit");
    };
    let num = &rest[..split];
    if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
        bail!("offset '{s}' has a missing or non-numeric magnitude");
    }
    let n: i64 = num
        .parse()
        .with_context(|| format!("offset '{s}' has an oversized magnitude"))?;
    let unit_secs = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        other => bail!("offset '{s}' has unknown unit '{other}' (use s, m, h or d)"),
    };
    let secs = n
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= MAX_OFFSET_DAYS * 86_400)
        .with_context(|| format!("offset '{s}' exceeds {MAX_OFFSET_DAYS} days"))?;
    Duration::try_seconds(sign * secs).with_context(|| format!("offset '{s}' is out of range"))
}

/// Render an offset in the largest whole unit, e.g. `-72h`.
pub fn format_offset(offset_secs: i64) -> String {
    let sign = if offset_secs < 0 { '-' } else { '+' };
    let abs = offset_secs.unsigned_abs();
    let (n, unit) = if abs != 0 && abs % 86_400 == 0 && abs / 86_400 > 3 {
        (abs / 86_400, 'd')
    } else if abs % 3600 == 0 {
        (abs / 3600, 'h')
    } else if abs % 60 == 0 {
        (abs / 60, 'm')
    } else {
        (abs, 's')
    };
    format!("{sign}{n}{unit}")
}

/// `results_fetch@+4h`
pub fn label(trigger: &TriggerDefinition) -> String {
    format!("{}@{}", trigger.category, format_offset(trigger.offset_secs))
}

/// Parse one `category@offset` entry.
pub fn parse_trigger(entry: &str) -> Result<TriggerDefinition> {
    let entry = entry.trim();
    let (category, offset) = entry
        .split_once('@')
        .with_context(|| format!("trigger '{entry}' must look like category@offset"))?;
    let category: TriggerCategory = category
        .trim()
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .with_context(|| format!("trigger '{entry}'"))?;
    let offset = parse_offset(offset).with_context(|| format!("trigger '{entry}'"))?;
    if category == TriggerCategory::ResultsFetch && offset <= Duration::zero() {
        bail!("trigger '{entry}': results can only be fetched after the start");
    }
    if category.is_pre_event() && offset >= Duration::zero() {
        bail!("trigger '{entry}': {category} must fire before the start");
    }
    Ok(TriggerDefinition::new(category, offset))
}

/// Parse a comma-separated trigger table. Duplicates are rejected since a
/// (category, offset) pair is the trigger's identity.
pub fn parse_trigger_table(table: &str) -> Result<Vec<TriggerDefinition>> {
    let mut triggers = Vec::new();
    for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let trigger = parse_trigger(entry)?;
        if triggers.contains(&trigger) {
            bail!("trigger '{entry}' is listed twice");
        }
        triggers.push(trigger);
    }
    if triggers.is_empty() {
        bail!("trigger table is empty");
    }
    Ok(triggers)
}
