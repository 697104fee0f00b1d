//! Wire rows of the source and their mapping onto [`ExternalEmployee`].
//!
//! Timestamps on the source are naive `YYYY-MM-DD HH:MM:SS` in KST.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Deserialize;

use sitesync_core::types::ExternalEmployee;

const SOURCE_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const KST_OFFSET_HOURS: i64 = 9;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceRow {
    #[serde(default)]
    pub empl_cd: Option<String>,
    #[serde(default)]
    pub empl_nm: Option<String>,
    #[serde(default)]
    pub part_cd: Option<String>,
    #[serde(default)]
    pub part_nm: Option<String>,
    #[serde(default)]
    pub tel_no: Option<String>,
    #[serde(default)]
    pub social_no: Option<String>,
    #[serde(default)]
    pub gojo_cd: Option<String>,
    #[serde(default)]
    pub role_cd: Option<String>,
    #[serde(default)]
    pub jijo_cd: Option<String>,
    #[serde(default)]
    pub state_flag: Option<String>,
    #[serde(default)]
    pub entr_day: Option<String>,
    #[serde(default)]
    pub retr_day: Option<String>,
    #[serde(default)]
    pub update_dt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcePage {
    #[serde(default)]
    pub employees: Vec<SourceRow>,
    #[serde(default)]
    pub total: u64,
}

fn text(v: Option<String>) -> String {
    v.map(|s| s.trim().to_string()).unwrap_or_default()
}

impl From<SourceRow> for ExternalEmployee {
    fn from(row: SourceRow) -> Self {
        let updated_at = row.update_dt.as_deref().and_then(parse_source_timestamp);
        let social = text(row.social_no);
        ExternalEmployee {
            employee_code: text(row.empl_cd),
            name: text(row.empl_nm),
            company_code: text(row.part_cd),
            company_name: text(row.part_nm),
            phone: text(row.tel_no),
            national_id_prefix: social.chars().take(7).collect(),
            job_code: text(row.gojo_cd),
            role_code: text(row.role_cd),
            position_code: text(row.jijo_cd),
            state_flag: text(row.state_flag),
            entry_date: text(row.entr_day),
            exit_date: text(row.retr_day),
            updated_at,
        }
    }
}

/// Parse a source-local KST timestamp into UTC.
pub fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), SOURCE_TS_FORMAT).ok()?;
    Some(naive.and_utc() - Duration::hours(KST_OFFSET_HOURS))
}

/// Lower bound of the incremental window: KST wall clock minus `lookback_secs`.
pub fn format_since(now: DateTime<Utc>, lookback_secs: u64) -> String {
    let kst = now + Duration::hours(KST_OFFSET_HOURS) - Duration::seconds(lookback_secs as i64);
    kst.format(SOURCE_TS_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn maps_and_trims_row() {
        let row: SourceRow = serde_json::from_value(serde_json::json!({
            "empl_cd": " E001 ",
            "empl_nm": "강호동",
            "part_cd": "P1",
            "part_nm": "Acme Construction",
            "tel_no": "010-1234-5678",
            "social_no": "9001011234567",
            "gojo_cd": "01",
            "state_flag": "W",
            "update_dt": "2026-01-05 09:30:00"
        }))
        .unwrap();
        let emp = ExternalEmployee::from(row);
        assert_eq!(emp.employee_code, "E001");
        assert_eq!(emp.national_id_prefix, "9001011");
        assert!(emp.is_active());
        assert_eq!(emp.role_code, "");
        assert_eq!(
            emp.updated_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 5, 0, 30, 0).unwrap())
        );
    }

    #[test]
    fn since_is_kst_minus_lookback() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 15, 2, 3).unwrap();
        // 00:02:03 KST on the 6th, minus five minutes.
        assert_eq!(format_since(now, 300), "2026-01-05 23:57:03");
    }

    #[test]
    fn bad_timestamp_is_none() {
        assert_eq!(parse_source_timestamp("yesterday"), None);
    }
}
