use std::collections::HashSet;

use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::generator::Candidate;
use super::EngineError;

pub(crate) fn validate_rule(rule: &RecurrenceRule) -> Result<(), EngineError> {
    if rule.weekday().is_none() {
        return Err(EngineError::InvalidRule("day of week must be between 1 and 7"));
    }
    if rule.start_time >= rule.end_time {
        return Err(EngineError::InvalidRule("start time must be before end time"));
    }
    if rule.valid_from > rule.valid_to {
        return Err(EngineError::InvalidRule("start date must not be after end date"));
    }
    if rule.repetition_frequency < 1 {
        return Err(EngineError::InvalidRule("repetition frequency must be at least one week"));
    }
    validate_location(&rule.location)
}

pub(crate) fn validate_location(location: &str) -> Result<(), EngineError> {
    if location.len() > MAX_LOCATION_LEN {
        return Err(EngineError::LimitExceeded("location too long"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidSession("start must be before end"));
    }
    Ok(())
}

/// Individual sessions of the group that overlap any candidate.
///
/// Every candidate is checked; a session hit by several candidates is reported
/// once. Sessions generated by a rule are skipped: the rule being replaced
/// takes them with it. Result is ordered by start.
pub fn find_schedule_conflicts(group: &GroupState, candidates: &[Candidate]) -> Vec<Session> {
    let mut seen = HashSet::new();
    let mut conflicts = Vec::new();
    for candidate in candidates {
        for existing in group.overlapping(&candidate.span) {
            if existing.is_individual() && seen.insert(existing.id) {
                conflicts.push(existing.clone());
            }
        }
    }
    conflicts.sort_by_key(|s| s.span.start);
    conflicts
}

pub(crate) fn check_no_schedule_conflict(
    group: &GroupState,
    candidates: &[Candidate],
    tz: Tz,
) -> Result<(), EngineError> {
    let conflicts = find_schedule_conflicts(group, candidates);
    if conflicts.is_empty() {
        return Ok(());
    }
    metrics::counter!(crate::observability::SCHEDULE_CONFLICTS_TOTAL).increment(1);
    tracing::info!(
        "schedule for group {} conflicts with {} session(s)",
        group.id,
        conflicts.len()
    );
    Err(EngineError::ScheduleConflict {
        conflicts,
        time_zone: tz,
    })
}

/// A single session may not overlap any other session of its group, generated or not.
pub(crate) fn check_no_session_overlap(
    group: &GroupState,
    span: &Span,
    exclude: Option<Ulid>,
    tz: Tz,
) -> Result<(), EngineError> {
    let overlapping: Vec<Session> = group
        .overlapping(span)
        .filter(|s| Some(s.id) != exclude)
        .cloned()
        .collect();
    if overlapping.is_empty() {
        Ok(())
    } else {
        Err(EngineError::SessionOverlap {
            overlapping,
            time_zone: tz,
        })
    }
}
