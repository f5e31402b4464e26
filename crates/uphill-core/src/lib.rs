use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid time of day: {0:?} (expected HH:MM)")]
    TimeOfDay(String),
    #[error("invalid date: {0:?} (expected YYYY-MM-DD)")]
    Date(String),
    #[error("invalid timestamp: {0:?} (expected RFC 3339)")]
    Timestamp(String),
    #[error("invalid recurrence day: {0} (expected 0..=6)")]
    RecurrenceDay(u8),
    #[error("invalid duration: {0} seconds")]
    Duration(u64),
}

/// Largest storable duration; SQLite integers are signed 64-bit.
pub const MAX_DURATION_SECONDS: u64 = i64::MAX as u64;

/// A user-defined routine. Owned exclusively by `owner_id`; the wire
/// names (`uid`, `time`) follow the original client contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    pub id: String,
    #[serde(rename = "uid")]
    pub owner_id: String,
    pub title: String,
    #[serde(rename = "time")]
    pub time_of_day: String,
    pub category: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub days: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutineCreate {
    pub title: String,
    #[serde(rename = "time")]
    pub time_of_day: String,
    pub category: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub days: Option<Vec<u8>>,
}

impl RoutineCreate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_time_of_day(&self.time_of_day)?;
        if let Some(days) = &self.days {
            validate_days(days)?;
        }
        Ok(())
    }
}

/// Partial update; absent fields keep their stored values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutineUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "time")]
    pub time_of_day: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub days: Option<Vec<u8>>,
}

impl RoutineUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(time) = &self.time_of_day {
            validate_time_of_day(time)?;
        }
        if let Some(days) = &self.days {
            validate_days(days)?;
        }
        Ok(())
    }
}

/// Immutable execution record. `date` is derived once at write time from
/// `started_at` (UTC calendar date) and is the only daily query key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    #[serde(skip)]
    pub owner_id: String,
    pub routine_id: String,
    pub routine_title: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_seconds: u64,
    pub date: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCreate {
    pub routine_title: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_seconds: u64,
}

impl ExecutionCreate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.duration_seconds > MAX_DURATION_SECONDS {
            return Err(ValidationError::Duration(self.duration_seconds));
        }
        Ok(())
    }
}

/// Derived per-day view; recomputed on every request, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: String,
    pub total_routines: u64,
    pub total_duration_seconds: u64,
    pub executions: Vec<ExecutionRecord>,
}

/// Fully populated feedback payload; every field has a value regardless
/// of how the generation went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub short: String,
    pub full: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineEvaluation {
    pub id: String,
    pub name: String,
    pub goal: String,
    pub steps: Vec<String>,
    pub score: i64,
    pub summary: String,
    pub risk: String,
    pub tip: String,
    pub raw_feedback: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationRequest {
    pub name: String,
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Strict 24-hour `HH:MM`: two-digit fields, hour 0-23, minute 0-59.
pub fn validate_time_of_day(input: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::TimeOfDay(input.to_string());
    let (hour, minute) = input.split_once(':').ok_or_else(invalid)?;
    // Integer FromStr accepts a leading sign, so digits are checked first.
    if hour.len() != 2
        || minute.len() != 2
        || !hour.bytes().all(|byte| byte.is_ascii_digit())
        || !minute.bytes().all(|byte| byte.is_ascii_digit())
    {
        return Err(invalid());
    }
    let hour: u8 = hour.parse().map_err(|_| invalid())?;
    let minute: u8 = minute.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok(())
}

/// Strict `YYYY-MM-DD` calendar date.
pub fn validate_date(input: &str) -> Result<NaiveDate, ValidationError> {
    if input.len() != 10 {
        return Err(ValidationError::Date(input.to_string()));
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| ValidationError::Date(input.to_string()))
}

/// RFC 3339 timestamp; a trailing `Z` UTC designator is accepted.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(input)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ValidationError::Timestamp(input.to_string()))
}

/// Calendar date a timestamp falls on, fixed to UTC at write time.
pub fn derived_date(started_at: &str) -> Result<String, ValidationError> {
    let ts = parse_timestamp(started_at)?;
    Ok(ts.date_naive().format("%Y-%m-%d").to_string())
}

pub fn validate_days(days: &[u8]) -> Result<(), ValidationError> {
    for &day in days {
        if day > 6 {
            return Err(ValidationError::RecurrenceDay(day));
        }
    }
    Ok(())
}
