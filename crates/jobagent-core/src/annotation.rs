//! `@KEY=value;` annotations embedded in job and step descriptions.
//!
//! An annotation occupies a whole line of the description. Keys are
//! upper-case letters and underscores; values are lower-case letters, digits
//! and spaces. Anything else on a line makes it plain text, which doubles as
//! validation: `@run_in_parallel=true;` is not an annotation.
//!
//! ```text
//! Nightly rollup of the billing tables.
//! @JOB_TIMEOUT=2 hr;
//! ```

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::types::{RunStatus, StepStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("not a number: {0:?}")]
    InvalidNumber(String),

    #[error("unknown unit: {0:?}")]
    UnknownUnit(String),

    #[error("value out of range: {0:?}")]
    OutOfRange(String),
}

/// The type an annotation key declares for its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// 64-bit integer; accepts a unit suffix and is then in milliseconds.
    Long,
    /// 32-bit integer with the same grammar as `Long`.
    Integer,
    Boolean,
    Text,
}

/// A known annotation key.
pub trait AnnotationDefinition: Copy {
    fn key(&self) -> &'static str;
    fn value_type(&self) -> ValueType;
}

/// A Rust type an annotation value can be read as.
pub trait AnnotationValue: Sized {
    const TYPE: ValueType;
    fn parse(raw: &str) -> Result<Self, AnnotationError>;
}

impl AnnotationValue for i64 {
    const TYPE: ValueType = ValueType::Long;

    fn parse(raw: &str) -> Result<Self, AnnotationError> {
        parse_scaled(raw)
    }
}

impl AnnotationValue for i32 {
    const TYPE: ValueType = ValueType::Integer;

    fn parse(raw: &str) -> Result<Self, AnnotationError> {
        let value = parse_scaled(raw)?;
        i32::try_from(value).map_err(|_| AnnotationError::OutOfRange(raw.to_string()))
    }
}

impl AnnotationValue for bool {
    const TYPE: ValueType = ValueType::Boolean;

    /// Lenient: `"true"` is true and anything else is false. Never fails.
    fn parse(raw: &str) -> Result<Self, AnnotationError> {
        Ok(raw == "true")
    }
}

impl AnnotationValue for String {
    const TYPE: ValueType = ValueType::Text;

    fn parse(raw: &str) -> Result<Self, AnnotationError> {
        Ok(raw.to_string())
    }
}

/// Extract every annotation in `text`. Later duplicates overwrite earlier ones.
pub fn parse_annotations(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(parse_line)
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let body = line.strip_prefix('@')?.strip_suffix(';')?;
    let (key, value) = body.split_once('=')?;

    let key_ok = !key.is_empty() && key.bytes().all(|b| b.is_ascii_uppercase() || b == b'_');
    let value_ok = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b' ');

    (key_ok && value_ok).then_some((key, value))
}

/// Read `raw` as a `T`.
///
/// Returns `Ok(None)` when `definition` does not declare `T`'s type, whatever
/// the value looks like.
pub fn parse_value<T, D>(definition: D, raw: &str) -> Result<Option<T>, AnnotationError>
where
    T: AnnotationValue,
    D: AnnotationDefinition,
{
    if definition.value_type() != T::TYPE {
        return Ok(None);
    }
    T::parse(raw).map(Some)
}

/// `"<digits> <unit>"` scaled to milliseconds, or a bare integer.
fn parse_scaled(raw: &str) -> Result<i64, AnnotationError> {
    if let Some((number, unit)) = raw.split_once(' ') {
        let digits = !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit());
        let letters = unit.bytes().all(|b| b.is_ascii_lowercase());
        if digits && letters {
            let n: i64 = number
                .parse()
                .map_err(|_| AnnotationError::OutOfRange(raw.to_string()))?;
            return n
                .checked_mul(unit_multiplier(unit)?)
                .ok_or_else(|| AnnotationError::OutOfRange(raw.to_string()));
        }
    }
    raw.parse::<i64>()
        .map_err(|_| AnnotationError::InvalidNumber(raw.to_string()))
}

fn unit_multiplier(unit: &str) -> Result<i64, AnnotationError> {
    match unit {
        "ms" => Ok(1),
        "s" | "sec" => Ok(1_000),
        "m" | "min" => Ok(60_000),
        "h" | "hr" => Ok(3_600_000),
        other => Err(AnnotationError::UnknownUnit(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Known keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAnnotation {
    JobTimeout,
}

impl AnnotationDefinition for JobAnnotation {
    fn key(&self) -> &'static str {
        match self {
            JobAnnotation::JobTimeout => "JOB_TIMEOUT",
        }
    }

    fn value_type(&self) -> ValueType {
        match self {
            JobAnnotation::JobTimeout => ValueType::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAnnotation {
    RunInParallel,
    JobStepTimeout,
    DatabaseName,
    DatabaseHost,
    DatabaseLogin,
    DatabasePassword,
    DatabaseAuthQuery,
    EmailOn,
    EmailSubject,
    EmailBody,
    EmailTo,
}

impl AnnotationDefinition for StepAnnotation {
    fn key(&self) -> &'static str {
        match self {
            StepAnnotation::RunInParallel => "RUN_IN_PARALLEL",
            StepAnnotation::JobStepTimeout => "JOB_STEP_TIMEOUT",
            StepAnnotation::DatabaseName => "DATABASE_NAME",
            StepAnnotation::DatabaseHost => "DATABASE_HOST",
            StepAnnotation::DatabaseLogin => "DATABASE_LOGIN",
            StepAnnotation::DatabasePassword => "DATABASE_PASSWORD",
            StepAnnotation::DatabaseAuthQuery => "DATABASE_AUTH_QUERY",
            StepAnnotation::EmailOn => "EMAIL_ON",
            StepAnnotation::EmailSubject => "EMAIL_SUBJECT",
            StepAnnotation::EmailBody => "EMAIL_BODY",
            StepAnnotation::EmailTo => "EMAIL_TO",
        }
    }

    fn value_type(&self) -> ValueType {
        match self {
            StepAnnotation::RunInParallel => ValueType::Boolean,
            StepAnnotation::JobStepTimeout => ValueType::Long,
            _ => ValueType::Text,
        }
    }
}

/// Look up `definition` in `annotations`, logging and skipping a bad value.
fn read<T, D>(annotations: &HashMap<String, String>, definition: D) -> Option<T>
where
    T: AnnotationValue,
    D: AnnotationDefinition,
{
    let raw = annotations.get(definition.key())?;
    match parse_value(definition, raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(annotation = definition.key(), value = %raw, error = %e, "skipping malformed annotation");
            None
        }
    }
}

fn read_duration<D: AnnotationDefinition>(
    annotations: &HashMap<String, String>,
    definition: D,
) -> Option<Duration> {
    let ms: i64 = read(annotations, definition)?;
    match u64::try_from(ms) {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!(annotation = definition.key(), ms, "skipping negative duration");
            None
        }
    }
}

/// Job-level behaviour read from the job description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOverrides {
    pub timeout: Option<Duration>,
}

impl JobOverrides {
    pub fn from_description(description: &str) -> Self {
        let annotations = parse_annotations(description);
        Self {
            timeout: read_duration(&annotations, JobAnnotation::JobTimeout),
        }
    }
}

/// Step-level behaviour read from the step description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOverrides {
    pub run_in_parallel: bool,
    pub timeout: Option<Duration>,
    pub database_name: Option<String>,
    pub database_host: Option<String>,
    pub database_login: Option<String>,
    pub database_password: Option<String>,
    pub database_auth_query: Option<String>,
    pub email_on: Vec<StepStatus>,
    pub email_to: Vec<String>,
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
}

impl StepOverrides {
    pub fn from_description(description: &str) -> Self {
        let a = parse_annotations(description);

        let email_on = read::<String, _>(&a, StepAnnotation::EmailOn)
            .map(|list| {
                list.split_whitespace()
                    .filter_map(|name| {
                        let status = RunStatus::from_name(name);
                        if status.is_none() {
                            warn!(status = name, "EMAIL_ON names an unknown status");
                        }
                        status
                    })
                    .collect()
            })
            .unwrap_or_default();

        let email_to = read::<String, _>(&a, StepAnnotation::EmailTo)
            .map(|list| list.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            run_in_parallel: read(&a, StepAnnotation::RunInParallel).unwrap_or(false),
            timeout: read_duration(&a, StepAnnotation::JobStepTimeout),
            database_name: read(&a, StepAnnotation::DatabaseName),
            database_host: read(&a, StepAnnotation::DatabaseHost),
            database_login: read(&a, StepAnnotation::DatabaseLogin),
            database_password: read(&a, StepAnnotation::DatabasePassword),
            database_auth_query: read(&a, StepAnnotation::DatabaseAuthQuery),
            email_on,
            email_to,
            email_subject: read(&a, StepAnnotation::EmailSubject),
            email_body: read(&a, StepAnnotation::EmailBody),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- parse_annotations ---

    #[test]
    fn extracts_key_and_value() {
        let map = parse_annotations("@JOB_TIMEOUT=42 min;");
        assert_eq!(map.get("JOB_TIMEOUT").map(String::as_str), Some("42 min"));
    }

    #[test]
    fn keeps_raw_value_even_when_it_will_not_parse() {
        assert_eq!(parse_annotations("@JOB_TIMEOUT=42min;")["JOB_TIMEOUT"], "42min");
        assert_eq!(parse_annotations("@JOB_TIMEOUT=4 2 min;")["JOB_TIMEOUT"], "4 2 min");
        assert_eq!(parse_annotations("@RUN_IN_PARALLEL= false;")["RUN_IN_PARALLEL"], " false");
        assert_eq!(parse_annotations("@RUN_IN_PARALLEL=bob24;")["RUN_IN_PARALLEL"], "bob24");
    }

    #[test]
    fn unknown_upper_case_keys_still_match() {
        assert!(parse_annotations("@RUN_NI_PARALLEL=true;").contains_key("RUN_NI_PARALLEL"));
    }

    #[test]
    fn keys_must_be_upper_case() {
        assert!(parse_annotations("@run_in_parallel=true;").is_empty());
        assert!(parse_annotations("@Run_in_parallel=true;").is_empty());
    }

    #[test]
    fn values_outside_the_character_class_do_not_match() {
        assert!(parse_annotations("@JOB_TIMEOUT=42 m/in;").is_empty());
        assert!(parse_annotations("@DATABASE_NAME=Sales;").is_empty());
        assert!(parse_annotations("@DATABASE_NAME=;").is_empty());
    }

    #[test]
    fn annotation_must_fill_the_line() {
        assert!(parse_annotations("see @JOB_TIMEOUT=5 s;").is_empty());
        assert!(parse_annotations("@JOB_TIMEOUT=5 s; trailing").is_empty());
        assert!(parse_annotations("@JOB_TIMEOUT=5 s").is_empty());
    }

    #[test]
    fn scans_every_line_and_last_write_wins() {
        let text = "Load the warehouse.\r\n@RUN_IN_PARALLEL=true;\n@JOB_STEP_TIMEOUT=1 s;\n\
                    notes\n@JOB_STEP_TIMEOUT=2 s;";
        let map = parse_annotations(text);
        assert_eq!(map.len(), 2);
        assert_eq!(map["RUN_IN_PARALLEL"], "true");
        assert_eq!(map["JOB_STEP_TIMEOUT"], "2 s");
    }

    // --- parse_value ---

    #[test]
    fn duration_units_scale_to_millis() {
        let def = JobAnnotation::JobTimeout;
        assert_eq!(parse_value::<i64, _>(def, "42 min"), Ok(Some(2_520_000)));
        assert_eq!(parse_value::<i64, _>(def, "7 ms"), Ok(Some(7)));
        assert_eq!(parse_value::<i64, _>(def, "3 s"), Ok(Some(3_000)));
        assert_eq!(parse_value::<i64, _>(def, "3 sec"), Ok(Some(3_000)));
        assert_eq!(parse_value::<i64, _>(def, "2 m"), Ok(Some(120_000)));
        assert_eq!(parse_value::<i64, _>(def, "1 h"), Ok(Some(3_600_000)));
        assert_eq!(parse_value::<i64, _>(def, "1 hr"), Ok(Some(3_600_000)));
        assert_eq!(parse_value::<i64, _>(def, "1500"), Ok(Some(1_500)));
    }

    #[test]
    fn malformed_durations_are_errors() {
        let def = JobAnnotation::JobTimeout;
        assert!(parse_value::<i64, _>(def, "42min").is_err());
        assert!(parse_value::<i64, _>(def, "4 2 min").is_err());
        assert!(parse_value::<i64, _>(def, " 42 min").is_err());
        assert_eq!(
            parse_value::<i64, _>(def, "42 days"),
            Err(AnnotationError::UnknownUnit("days".to_string()))
        );
        assert_eq!(
            parse_value::<i64, _>(def, "42 "),
            Err(AnnotationError::UnknownUnit(String::new()))
        );
    }

    #[test]
    fn integer_type_rejects_values_that_overflow() {
        #[derive(Clone, Copy)]
        struct Retries;
        impl AnnotationDefinition for Retries {
            fn key(&self) -> &'static str {
                "RETRIES"
            }
            fn value_type(&self) -> ValueType {
                ValueType::Integer
            }
        }

        assert_eq!(parse_value::<i32, _>(Retries, "3"), Ok(Some(3)));
        assert_eq!(parse_value::<i32, _>(Retries, "2 s"), Ok(Some(2_000)));
        assert!(parse_value::<i32, _>(Retries, "1000 h").is_err());
    }

    #[test]
    fn mismatched_type_is_not_applicable() {
        assert_eq!(parse_value::<bool, _>(JobAnnotation::JobTimeout, "42 min"), Ok(None));
        assert_eq!(parse_value::<i32, _>(JobAnnotation::JobTimeout, "42 min"), Ok(None));
        assert_eq!(parse_value::<i64, _>(StepAnnotation::RunInParallel, "4 2 min"), Ok(None));
        assert_eq!(parse_value::<String, _>(StepAnnotation::JobStepTimeout, "x"), Ok(None));
    }

    #[test]
    fn boolean_parse_is_lenient() {
        let def = StepAnnotation::RunInParallel;
        assert_eq!(parse_value::<bool, _>(def, "true"), Ok(Some(true)));
        assert_eq!(parse_value::<bool, _>(def, "false"), Ok(Some(false)));
        assert_eq!(parse_value::<bool, _>(def, " false"), Ok(Some(false)));
        assert_eq!(parse_value::<bool, _>(def, "bob24"), Ok(Some(false)));
        assert_eq!(parse_value::<bool, _>(def, " bob"), Ok(Some(false)));
    }

    #[test]
    fn text_passes_through_unchanged() {
        assert_eq!(
            parse_value::<String, _>(StepAnnotation::DatabaseHost, " db 2 "),
            Ok(Some(" db 2 ".to_string()))
        );
    }

    // --- overrides ---

    #[test]
    fn job_overrides_read_timeout() {
        let o = JobOverrides::from_description("Nightly\n@JOB_TIMEOUT=2 s;");
        assert_eq!(o.timeout, Some(Duration::from_secs(2)));
        assert_eq!(JobOverrides::from_description("plain text"), JobOverrides::default());
    }

    #[test]
    fn malformed_annotation_is_skipped_alone() {
        let o = StepOverrides::from_description(
            "@JOB_STEP_TIMEOUT=42min;\n@RUN_IN_PARALLEL=true;\n@DATABASE_NAME=sales;",
        );
        assert_eq!(o.timeout, None);
        assert!(o.run_in_parallel);
        assert_eq!(o.database_name.as_deref(), Some("sales"));
    }

    #[test]
    fn garbage_parallel_flag_defaults_to_false() {
        let o = StepOverrides::from_description("@RUN_IN_PARALLEL=yes please;");
        assert!(!o.run_in_parallel);
    }

    #[test]
    fn email_lists_split_on_whitespace() {
        let o = StepOverrides::from_description(
            "@EMAIL_ON=fail aborted nonsense;\n@EMAIL_TO=ops dba;\n\
             @EMAIL_SUBJECT=jobname ended with status;",
        );
        assert_eq!(o.email_on, vec![RunStatus::Fail, RunStatus::Aborted]);
        assert_eq!(o.email_to, vec!["ops".to_string(), "dba".to_string()]);
        assert_eq!(o.email_subject.as_deref(), Some("jobname ended with status"));
        assert_eq!(o.email_body, None);
    }
}
