//! Due-evaluation for interval schedules.
//!
//! Minutes and hours are fixed-length and use plain instant arithmetic on a
//! grid anchored at the schedule's start: a run anywhere inside a slot makes
//! the schedule due again at the start of the next slot.
//! Days, weeks and months are calendar units: they are added to the local
//! wall-clock time in the configured zone and resolved back to an instant,
//! so a day that spans a DST transition lasts 23 or 25 real hours.

use chrono::{DateTime, Days, Duration, LocalResult, Months, NaiveDateTime, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::types::IntervalUnit;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalError {
    #[error("interval value must be at least 1")]
    ZeroValue,

    #[error("advancing {value} {unit}(s) overflows the calendar")]
    Overflow { unit: IntervalUnit, value: u32 },
}

/// Drop sub-second precision; the engine compares whole seconds only.
pub fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(0).unwrap_or(t)
}

/// Is an interval schedule due at `now`?
///
/// Outside the `[start, end]` window the answer is always `false`. A schedule
/// that never ran is due as soon as the window opens; otherwise it is due once
/// `now` reaches [`next_due`].
pub fn is_due(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    unit: IntervalUnit,
    value: u32,
    last_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    zone: Tz,
) -> Result<bool, IntervalError> {
    if value == 0 {
        return Err(IntervalError::ZeroValue);
    }

    let now = whole_seconds(now);
    if now < whole_seconds(start) || end.is_some_and(|end| now > whole_seconds(end)) {
        return Ok(false);
    }

    let Some(last_start) = last_start else {
        return Ok(true);
    };

    let next = next_due(whole_seconds(start), whole_seconds(last_start), unit, value, zone)
        .ok_or(IntervalError::Overflow { unit, value })?;
    Ok(now >= next)
}

/// The instant at which a schedule that last started at `last_start` becomes due again.
///
/// Minute and hour intervals round `last_start` down to its slot on the grid
/// `start + k * step` before stepping, so a run at 02:03 on a five-minute grid
/// anchored at midnight makes the schedule due at 02:05. A run from before
/// `start` never pushes the first slot past the window opening. Calendar
/// units step from `last_start` itself.
pub fn next_due(
    start: DateTime<Utc>,
    last_start: DateTime<Utc>,
    unit: IntervalUnit,
    value: u32,
    zone: Tz,
) -> Option<DateTime<Utc>> {
    match unit {
        IntervalUnit::Minute | IntervalUnit::Hour => {
            let step = fixed_step_secs(unit, value)?;
            let elapsed = (last_start - start).num_seconds();
            let slot = start.checked_add_signed(Duration::seconds(elapsed.div_euclid(step).checked_mul(step)?))?;
            Some(slot.checked_add_signed(Duration::seconds(step))?.max(start))
        }
        IntervalUnit::Day | IntervalUnit::Week | IntervalUnit::Month => advance(last_start, unit, value, zone),
    }
}

fn fixed_step_secs(unit: IntervalUnit, value: u32) -> Option<i64> {
    let per_unit = match unit {
        IntervalUnit::Minute => 60,
        IntervalUnit::Hour => 3_600,
        _ => return None,
    };
    i64::from(value).checked_mul(per_unit)
}

/// Advance `from` by `value` `unit`s. Returns `None` on calendar overflow.
pub fn advance(from: DateTime<Utc>, unit: IntervalUnit, value: u32, zone: Tz) -> Option<DateTime<Utc>> {
    match unit {
        IntervalUnit::Minute | IntervalUnit::Hour => {
            from.checked_add_signed(Duration::seconds(fixed_step_secs(unit, value)?))
        }
        IntervalUnit::Day => add_wall_clock(from, zone, |local| local.checked_add_days(Days::new(u64::from(value)))),
        IntervalUnit::Week => {
            add_wall_clock(from, zone, |local| local.checked_add_days(Days::new(u64::from(value) * 7)))
        }
        // checked_add_months clamps the day to the last valid day of the target month.
        IntervalUnit::Month => add_wall_clock(from, zone, |local| local.checked_add_months(Months::new(value))),
    }
}

fn add_wall_clock(
    from: DateTime<Utc>,
    zone: Tz,
    step: impl FnOnce(NaiveDateTime) -> Option<NaiveDateTime>,
) -> Option<DateTime<Utc>> {
    let local = from.with_timezone(&zone).naive_local();
    resolve_wall_clock(step(local)?, zone)
}

/// Map a local wall-clock time back to an instant.
///
/// Ambiguous times (fall-back overlap) take the earlier instant. Times inside
/// a spring-forward gap are read with the offset in effect before the gap,
/// which lands just after it.
fn resolve_wall_clock(local: NaiveDateTime, zone: Tz) -> Option<DateTime<Utc>> {
    match zone.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let before_gap = local.checked_sub_days(Days::new(1))?;
            let offset = zone.offset_from_utc_datetime(&before_gap).fix();
            let utc = local.checked_sub_signed(Duration::seconds(i64::from(offset.local_minus_utc())))?;
            Some(Utc.from_utc_datetime(&utc))
        }
    }
}
