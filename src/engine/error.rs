use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::{format_local, Session};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidRule(&'static str),
    InvalidSession(&'static str),
    /// Generated sessions collide with individual sessions of the group.
    /// Carries every colliding session, not just the first.
    ScheduleConflict {
        conflicts: Vec<Session>,
        time_zone: Tz,
    },
    /// An individual session collides with other sessions of the group.
    SessionOverlap {
        overlapping: Vec<Session>,
        time_zone: Tz,
    },
    NoTimeZone,
    UnknownTimeZone(String),
    CancelledByFreePeriod(Ulid),
    LimitExceeded(&'static str),
    JournalError(String),
}

fn write_sessions(f: &mut std::fmt::Formatter<'_>, sessions: &[Session], tz: &Tz) -> std::fmt::Result {
    for (i, s) in sessions.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(
            f,
            "{} - {}",
            format_local(tz, s.span.start),
            format_local(tz, s.span.end)
        )?;
    }
    Ok(())
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidRule(msg) => write!(f, "invalid schedule: {msg}"),
            EngineError::InvalidSession(msg) => write!(f, "invalid session: {msg}"),
            EngineError::ScheduleConflict {
                conflicts,
                time_zone,
            } => {
                write!(
                    f,
                    "schedule conflicts with {} existing session(s) ({time_zone}): ",
                    conflicts.len()
                )?;
                write_sessions(f, conflicts, time_zone)
            }
            EngineError::SessionOverlap {
                overlapping,
                time_zone,
            } => {
                write!(f, "session overlaps with existing session(s) ({time_zone}): ")?;
                write_sessions(f, overlapping, time_zone)
            }
            EngineError::NoTimeZone => write!(f, "course has no time zone"),
            EngineError::UnknownTimeZone(name) => write!(f, "unknown time zone: {name}"),
            EngineError::CancelledByFreePeriod(id) => {
                write!(f, "session {id} is cancelled by a free period")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::JournalError(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
