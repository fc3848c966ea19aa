//! JSON command model for the operator driver.
//!
//! One command per line, tagged by `op`:
//!
//! ```json
//! {"op":"set_schedule","course":"01J...","group":"01J...","schedule":{"day_of_week":1,
//!  "start_time":"10:00:00","end_time":"12:00:00","valid_from":"2024-10-16",
//!  "valid_to":"2024-11-20","repetition_frequency":1,"location":"MI HS 1"}}
//! ```

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Deserialize;
use serde_json::{json, Value};
use ulid::Ulid;

use crate::engine::{Candidate, Engine, EngineError};
use crate::model::*;
use crate::registry::CourseRegistry;

/// A recurrence rule as the caller writes it. Rule ids are assigned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleSpec {
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
    #[serde(default = "one")]
    pub repetition_frequency: u32,
    #[serde(default)]
    pub location: String,
}

fn one() -> u32 {
    1
}

impl From<RuleSpec> for RecurrenceRule {
    fn from(input: RuleSpec) -> Self {
        RecurrenceRule {
            id: Ulid::nil(),
            day_of_week: input.day_of_week,
            start_time: input.start_time,
            end_time: input.end_time,
            valid_from: input.valid_from,
            valid_to: input.valid_to,
            repetition_frequency: input.repetition_frequency,
            location: input.location,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    ConfigureCourse {
        course: Ulid,
        time_zone: String,
    },
    CreateGroup {
        course: Ulid,
        id: Option<Ulid>,
        title: String,
        schedule: Option<RuleSpec>,
    },
    DeleteGroup {
        course: Ulid,
        group: Ulid,
    },
    SetSchedule {
        course: Ulid,
        group: Ulid,
        schedule: Option<RuleSpec>,
    },
    PreviewSchedule {
        course: Ulid,
        schedule: RuleSpec,
    },
    /// Bounds are wall-clock times in the course time zone.
    AddFreePeriod {
        course: Ulid,
        id: Option<Ulid>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        reason: Option<String>,
    },
    RemoveFreePeriod {
        course: Ulid,
        id: Ulid,
    },
    CreateSession {
        course: Ulid,
        group: Ulid,
        id: Option<Ulid>,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        #[serde(default)]
        location: String,
    },
    UpdateSession {
        course: Ulid,
        id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        #[serde(default)]
        location: String,
    },
    DeleteSession {
        course: Ulid,
        id: Ulid,
    },
    CancelSession {
        course: Ulid,
        id: Ulid,
        explanation: Option<String>,
    },
    ActivateSession {
        course: Ulid,
        id: Ulid,
    },
    RecordAttendance {
        course: Ulid,
        id: Ulid,
        count: Option<u32>,
    },
    ListGroups {
        course: Ulid,
    },
    ListSessions {
        course: Ulid,
        group: Ulid,
    },
    ListFreePeriods {
        course: Ulid,
    },
    ImportGroups {
        from: Ulid,
        to: Ulid,
    },
}

fn open(registry: &CourseRegistry, course: Ulid) -> Result<Arc<Engine>, EngineError> {
    registry
        .get_or_open(course)
        .map_err(|e| EngineError::JournalError(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::JournalError(e.to_string()))
}

fn candidate_json(tz: &chrono_tz::Tz, c: &Candidate) -> Value {
    json!({
        "start": format_local(tz, c.span.start),
        "end": format_local(tz, c.span.end),
        "location": c.location,
        "status": c.status.label(),
        "free_period_id": c.status.free_period_id(),
    })
}

/// Run one command and return its JSON result.
pub async fn execute(registry: &CourseRegistry, cmd: Command) -> Result<Value, EngineError> {
    match cmd {
        Command::ConfigureCourse { course, time_zone } => {
            open(registry, course)?.configure_course(&time_zone).await?;
            Ok(json!({ "time_zone": time_zone }))
        }
        Command::CreateGroup {
            course,
            id,
            title,
            schedule,
        } => {
            let id = id.unwrap_or_else(Ulid::new);
            let sessions = open(registry, course)?
                .create_group(id, title, schedule.map(Into::into))
                .await?;
            Ok(json!({ "id": id, "sessions": sessions.len() }))
        }
        Command::DeleteGroup { course, group } => {
            open(registry, course)?.delete_group(group).await?;
            Ok(json!({ "deleted": group }))
        }
        Command::SetSchedule {
            course,
            group,
            schedule,
        } => {
            let engine = open(registry, course)?;
            let change = engine.set_schedule(group, schedule.map(Into::into)).await?;
            let sessions = engine.sessions_of_schedule(group).await?;
            Ok(json!({ "change": change.label(), "sessions": sessions.len() }))
        }
        Command::PreviewSchedule { course, schedule } => {
            let engine = open(registry, course)?;
            let candidates = engine.preview_sessions(&schedule.into()).await?;
            let tz = engine.time_zone().await.ok_or(EngineError::NoTimeZone)?;
            let rendered: Vec<Value> = candidates.iter().map(|c| candidate_json(&tz, c)).collect();
            Ok(Value::Array(rendered))
        }
        Command::AddFreePeriod {
            course,
            id,
            start,
            end,
            reason,
        } => {
            let engine = open(registry, course)?;
            let tz = engine.time_zone().await.ok_or(EngineError::NoTimeZone)?;
            let span = Span {
                start: zoned_ms(&tz, start.date(), start.time()),
                end: zoned_ms(&tz, end.date(), end.time()),
            };
            let id = id.unwrap_or_else(Ulid::new);
            let cancelled = engine.add_free_period(id, span, reason).await?;
            Ok(json!({ "id": id, "sessions_changed": cancelled }))
        }
        Command::RemoveFreePeriod { course, id } => {
            let changed = open(registry, course)?.remove_free_period(id).await?;
            Ok(json!({ "deleted": id, "sessions_changed": changed }))
        }
        Command::CreateSession {
            course,
            group,
            id,
            date,
            start_time,
            end_time,
            location,
        } => {
            let id = id.unwrap_or_else(Ulid::new);
            let session = open(registry, course)?
                .create_session(id, group, date, start_time, end_time, location)
                .await?;
            to_json(&session)
        }
        Command::UpdateSession {
            course,
            id,
            date,
            start_time,
            end_time,
            location,
        } => {
            let session = open(registry, course)?
                .update_session(id, date, start_time, end_time, location)
                .await?;
            to_json(&session)
        }
        Command::DeleteSession { course, id } => {
            open(registry, course)?.delete_session(id).await?;
            Ok(json!({ "deleted": id }))
        }
        Command::CancelSession {
            course,
            id,
            explanation,
        } => to_json(&open(registry, course)?.cancel_session(id, explanation).await?),
        Command::ActivateSession { course, id } => {
            to_json(&open(registry, course)?.activate_session(id).await?)
        }
        Command::RecordAttendance { course, id, count } => {
            open(registry, course)?.record_attendance(id, count).await?;
            Ok(json!({ "id": id, "attendance_count": count }))
        }
        Command::ListGroups { course } => to_json(&open(registry, course)?.list_groups().await),
        Command::ListSessions { course, group } => {
            to_json(&open(registry, course)?.list_sessions(group).await?)
        }
        Command::ListFreePeriods { course } => {
            to_json(&open(registry, course)?.list_free_periods().await)
        }
        Command::ImportGroups { from, to } => {
            let created = registry.import_tutorial_groups(from, to).await?;
            Ok(json!({ "created": created }))
        }
    }
}
