use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};

use crate::cli_utils::parse_timestamp;
use rsq::CronExpr;
use rsq::cron::truncate_to_minute;

fn resolve_instant(raw: Option<&str>) -> Result<DateTime<Utc>> {
    match raw {
        Some(raw) => parse_timestamp(raw),
        None => Ok(Utc::now()),
    }
}

/// Fire times strictly after the minute containing `from`, up to `end`.
pub(crate) fn upcoming(
    expr: &CronExpr,
    from: DateTime<Utc>,
    count: usize,
    end: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let mut cursor = truncate_to_minute(from) + TimeDelta::minutes(1);
    let mut fires = Vec::with_capacity(count);
    while fires.len() < count {
        let Some(at) = expr.next(cursor, Some(end)) else {
            break;
        };
        fires.push(at);
        cursor = at + TimeDelta::minutes(1);
    }
    fires
}

pub(crate) fn cron_check(expression: &str, at: Option<&str>) -> Result<()> {
    let expr = CronExpr::parse(expression)?;
    let tick = truncate_to_minute(resolve_instant(at)?);
    let verdict = if expr.matches(&tick) {
        "matches"
    } else {
        "does not match"
    };
    println!("{expr} {verdict} {}", tick.to_rfc3339());
    Ok(())
}

pub(crate) fn cron_next(
    expression: &str,
    from: Option<&str>,
    count: usize,
    horizon_hours: i64,
) -> Result<()> {
    if horizon_hours <= 0 {
        anyhow::bail!("--horizon-hours must be positive");
    }
    let expr = CronExpr::parse(expression)?;
    let from = resolve_instant(from)?;
    let end = TimeDelta::try_hours(horizon_hours)
        .and_then(|horizon| from.checked_add_signed(horizon))
        .with_context(|| format!("--horizon-hours {horizon_hours} is out of range"))?;
    let fires = upcoming(&expr, from, count, end);
    if fires.is_empty() {
        println!("{expr} does not fire within {horizon_hours}h of {}", from.to_rfc3339());
        return Ok(());
    }
    for at in fires {
        println!("{}", at.to_rfc3339());
    }
    Ok(())
}
