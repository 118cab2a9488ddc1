use chrono::{DateTime, Datelike, Utc};
use harvest_core::ConfigMap;
use serde_json::Value as JsonValue;

/// How a source expects its "changed since" bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceFormat {
    /// A `strftime` formatted date string.
    Date(&'static str),
    /// The calendar year as an integer.
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalRule {
    pub source: &'static str,
    pub param: &'static str,
    pub format: SinceFormat,
}

pub const INCREMENTAL_RULES: &[IncrementalRule] = &[
    IncrementalRule {
        source: "usaspending",
        param: "start_date",
        format: SinceFormat::Date("%Y-%m-%d"),
    },
    IncrementalRule {
        source: "sam_gov",
        param: "posted_from",
        format: SinceFormat::Date("%m/%d/%Y"),
    },
    IncrementalRule {
        source: "nih_reporter",
        param: "fiscal_year",
        format: SinceFormat::Year,
    },
    IncrementalRule {
        source: "openalex",
        param: "from_updated_date",
        format: SinceFormat::Date("%Y-%m-%d"),
    },
    IncrementalRule {
        source: "fred",
        param: "observation_start",
        format: SinceFormat::Date("%Y-%m-%d"),
    },
    IncrementalRule {
        source: "worldbank",
        param: "start_year",
        format: SinceFormat::Year,
    },
];

pub fn rule_for(source: &str) -> Option<&'static IncrementalRule> {
    INCREMENTAL_RULES.iter().find(|r| r.source == source)
}

/// `"incremental": true` in a job or schedule config.
pub fn wants_incremental(config: &ConfigMap) -> bool {
    config
        .get("incremental")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false)
}

/// Copy of `config` with the source's since-parameter set. Without a prior
/// run (`since` is `None`) or a mapping for the source the copy is unchanged,
/// so a first run is always a full load.
pub fn inject_incremental(source: &str, config: &ConfigMap, since: Option<DateTime<Utc>>) -> ConfigMap {
    let mut out = config.clone();
    let (Some(since), Some(rule)) = (since, rule_for(source)) else {
        return out;
    };
    let value = match rule.format {
        SinceFormat::Date(fmt) => JsonValue::from(since.format(fmt).to_string()),
        SinceFormat::Year => JsonValue::from(since.year()),
    };
    out.insert(rule.param.to_string(), value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn base_config() -> ConfigMap {
        json!({ "incremental": true, "params": { "q": "soil" } })
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn first_run_passes_config_through() {
        let config = base_config();
        for rule in INCREMENTAL_RULES {
            assert_eq!(inject_incremental(rule.source, &config, None), config);
        }
    }

    #[test]
    fn prior_run_sets_source_specific_param() {
        let since = Utc.with_ymd_and_hms(2026, 2, 7, 13, 30, 0).single().unwrap();
        let config = base_config();
        let expected = [
            ("usaspending", "start_date", json!("2026-02-07")),
            ("sam_gov", "posted_from", json!("02/07/2026")),
            ("nih_reporter", "fiscal_year", json!(2026)),
            ("openalex", "from_updated_date", json!("2026-02-07")),
            ("fred", "observation_start", json!("2026-02-07")),
            ("worldbank", "start_year", json!(2026)),
        ];
        for (source, param, value) in expected {
            let out = inject_incremental(source, &config, Some(since));
            assert_eq!(out.get(param), Some(&value), "{source}");
            assert_eq!(out.get("params"), config.get("params"));
        }
        assert!(!config.contains_key("start_date"));
    }

    #[test]
    fn unknown_source_is_left_alone() {
        let since = Utc::now();
        let config = base_config();
        assert_eq!(inject_incremental("mystery", &config, Some(since)), config);
    }

    #[test]
    fn incremental_flag_is_read_from_config() {
        assert!(wants_incremental(&base_config()));
        assert!(!wants_incremental(&ConfigMap::new()));
    }
}
