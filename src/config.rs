use std::path::PathBuf;
use std::str::FromStr;

use chrono::{FixedOffset, NaiveTime, Offset, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::limits::*;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("schedule: {0}")]
    Schedule(String),
    #[error("schedule file {path}: {source}")]
    ScheduleFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("schedule file {path}: {source}")]
    ScheduleJson {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Break {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Opening hours of a business, in its own wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    #[serde(default)]
    pub breaks: Vec<Break>,
    #[serde(default)]
    pub closed_weekdays: Vec<Weekday>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            open: hm(9, 0),
            close: hm(18, 0),
            breaks: Vec::new(),
            closed_weekdays: Vec::new(),
            utc_offset_minutes: 0,
        }
    }
}

impl BusinessHours {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.close < self.open {
            return Err(ConfigError::Schedule(format!(
                "close {} is before open {}",
                self.close, self.open
            )));
        }
        for b in &self.breaks {
            if b.end <= b.start {
                return Err(ConfigError::Schedule(format!("break {}-{} is empty", b.start, b.end)));
            }
            if b.start < self.open || b.end > self.close {
                return Err(ConfigError::Schedule(format!(
                    "break {}-{} falls outside opening hours",
                    b.start, b.end
                )));
            }
        }
        if FixedOffset::east_opt(self.utc_offset_minutes * 60).is_none() {
            return Err(ConfigError::Schedule(format!(
                "utc offset {} minutes out of range",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }
}

/// Whether a terminal appointment may be moved back to `Scheduled`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestorePolicy {
    #[default]
    Allow,
    Deny,
}

impl FromStr for RestorePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "allow" => Ok(RestorePolicy::Allow),
            "deny" => Ok(RestorePolicy::Deny),
            _ => Err(()),
        }
    }
}

/// Per-business scheduling knobs handed to every engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub hours: BusinessHours,
    pub step_minutes: u32,
    pub buffer_minutes: u32,
    pub restore: RestorePolicy,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hours: BusinessHours::default(),
            step_minutes: 30,
            buffer_minutes: 0,
            restore: RestorePolicy::Allow,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hours.validate()?;
        if self.step_minutes == 0 || self.step_minutes > MAX_STEP_MINUTES {
            return Err(ConfigError::Schedule(format!(
                "step {} must be within 1..={MAX_STEP_MINUTES}",
                self.step_minutes
            )));
        }
        if self.buffer_minutes > MAX_BUFFER_MINUTES {
            return Err(ConfigError::Schedule(format!(
                "buffer {} exceeds {MAX_BUFFER_MINUTES}",
                self.buffer_minutes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub schedule: ScheduleConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any `AGENDA_*` lookup. Unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let mut hours = match get("AGENDA_SCHEDULE_FILE") {
            Some(path) => load_hours_file(PathBuf::from(path))?,
            None => BusinessHours::default(),
        };
        if let Some(v) = get("AGENDA_OPEN") {
            hours.open = parse_time("AGENDA_OPEN", &v)?;
        }
        if let Some(v) = get("AGENDA_CLOSE") {
            hours.close = parse_time("AGENDA_CLOSE", &v)?;
        }
        if let Some(v) = get("AGENDA_UTC_OFFSET_MINUTES") {
            hours.utc_offset_minutes = parse_num("AGENDA_UTC_OFFSET_MINUTES", &v)?;
        }

        let restore = match get("AGENDA_RESTORE") {
            Some(v) => v.parse().map_err(|()| ConfigError::Invalid {
                var: "AGENDA_RESTORE",
                value: v.clone(),
                reason: "expected allow or deny",
            })?,
            None => RestorePolicy::Allow,
        };

        let schedule = ScheduleConfig {
            hours,
            step_minutes: opt_num(&get, "AGENDA_STEP_MINUTES")?.unwrap_or(30),
            buffer_minutes: opt_num(&get, "AGENDA_BUFFER_MINUTES")?.unwrap_or(0),
            restore,
        };
        schedule.validate()?;

        let tls_cert = get("AGENDA_TLS_CERT");
        let tls_key = get("AGENDA_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::Invalid {
                var: "AGENDA_TLS_CERT",
                value: tls_cert.or(tls_key).unwrap_or_default(),
                reason: "AGENDA_TLS_CERT and AGENDA_TLS_KEY must be set together",
            });
        }

        Ok(Self {
            port: opt_num(&get, "AGENDA_PORT")?.unwrap_or(5433),
            bind: get("AGENDA_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("AGENDA_DATA_DIR").unwrap_or_else(|| "./data".into())),
            user: get("AGENDA_USER").unwrap_or_else(|| "agenda".into()),
            password: get("AGENDA_PASSWORD").unwrap_or_else(|| "agenda".into()),
            max_connections: opt_num(&get, "AGENDA_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: opt_num(&get, "AGENDA_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: opt_num(&get, "AGENDA_METRICS_PORT")?,
            tls_cert,
            tls_key,
            schedule,
        })
    }
}

fn load_hours_file(path: PathBuf) -> Result<BusinessHours, ConfigError> {
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::ScheduleFile {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::ScheduleJson { path, source })
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

pub fn parse_time(var: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value.trim(), "%H:%M:%S"))
        .map_err(|_| ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected HH:MM",
        })
}

fn parse_num<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: "expected a number",
    })
}

fn opt_num<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var).map(|v| parse_num(var, &v)).transpose()
}
