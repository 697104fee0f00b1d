use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::types::JobSchedule;

/// Korea Standard Time is a fixed UTC+9 with no DST, so a constant offset is
/// applied instead of a timezone database.
pub const KST_OFFSET_MS: i64 = 9 * 60 * 60 * 1000;

/// Shift a UTC epoch-ms instant so its UTC calendar fields read as KST.
pub fn to_kst(epoch_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(epoch_ms + KST_OFFSET_MS).unwrap_or_default()
}

/// True when every constrained field of `schedule` matches `now_kst`.
pub fn is_within_window(schedule: &JobSchedule, now_kst: &DateTime<Utc>) -> bool {
    if let Some(hour) = schedule.kst_hour {
        if now_kst.hour() != hour as u32 {
            return false;
        }
    }
    if let Some(dow) = schedule.day_of_week {
        if now_kst.weekday().num_days_from_sunday() != dow as u32 {
            return false;
        }
    }
    if let Some(dom) = schedule.day_of_month {
        if now_kst.day() != dom as u32 {
            return false;
        }
    }
    true
}

/// `YYYY-MM-DD-HH` of a KST-shifted instant.
pub fn window_key(now_kst: &DateTime<Utc>) -> String {
    now_kst.format("%Y-%m-%d-%H").to_string()
}

pub fn window_key_from_ms(epoch_ms: i64) -> String {
    window_key(&to_kst(epoch_ms))
}

/// Due-check for one job at `now_ms` given its last recorded run.
pub fn is_due(schedule: &JobSchedule, now_ms: i64, last_run_ms: Option<i64>) -> bool {
    let now_kst = to_kst(now_ms);
    if !is_within_window(schedule, &now_kst) {
        return false;
    }

    let Some(last_run) = last_run_ms else {
        return true;
    };

    if schedule.is_windowed() {
        window_key(&now_kst) != window_key_from_ms(last_run)
    } else {
        now_ms - last_run >= schedule.interval_ms as i64
    }
}
