use std::time::Instant;

use chrono_tz::Tz;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_schedule_conflict, validate_rule};
use super::generator::{generate_sessions, Candidate};
use super::{require_time_zone, Engine, EngineError};

/// How a rule edit is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleChange {
    /// Nothing to do.
    Unchanged,
    /// First rule for the group: generate, validate, materialize.
    Create,
    /// Rule dropped: delete it and its generated sessions.
    Delete,
    /// Only the location moved: rewrite it in place, keep every session.
    Relocate,
    /// Timing changed: regenerate from scratch.
    Regenerate,
}

impl ScheduleChange {
    pub fn label(&self) -> &'static str {
        match self {
            ScheduleChange::Unchanged => "unchanged",
            ScheduleChange::Create => "create",
            ScheduleChange::Delete => "delete",
            ScheduleChange::Relocate => "relocate",
            ScheduleChange::Regenerate => "regenerate",
        }
    }
}

/// Decide how to get from the group's current rule to the requested one.
/// Rule ids are ignored; only the scheduling fields and the location count.
pub fn classify(old: Option<&RecurrenceRule>, new: Option<&RecurrenceRule>) -> ScheduleChange {
    match (old, new) {
        (None, None) => ScheduleChange::Unchanged,
        (None, Some(_)) => ScheduleChange::Create,
        (Some(_), None) => ScheduleChange::Delete,
        (Some(o), Some(n)) if !o.same_timing(n) => ScheduleChange::Regenerate,
        (Some(o), Some(n)) if o.location != n.location => ScheduleChange::Relocate,
        (Some(_), Some(_)) => ScheduleChange::Unchanged,
    }
}

impl Engine {
    /// Replace, create or drop the recurrence rule of a tutorial group and
    /// bring its generated sessions in line.
    ///
    /// Individual sessions are never touched. On a conflict with one of them
    /// nothing is persisted and the error lists every colliding session.
    /// Create and regenerate give the stored rule a fresh id; relocation keeps it.
    pub async fn set_schedule(
        &self,
        group_id: Ulid,
        rule: Option<RecurrenceRule>,
    ) -> Result<ScheduleChange, EngineError> {
        if let Some(ref r) = rule {
            validate_rule(r)?;
        }
        let course = self.course.read().await;
        let gs = self
            .get_group(&group_id)
            .ok_or(EngineError::NotFound(group_id))?;
        let mut guard = gs.write().await;

        let change = classify(guard.schedule.as_ref(), rule.as_ref());
        let current = guard.schedule.as_ref().map(|r| r.id);
        match (change, current, rule) {
            (ScheduleChange::Delete, Some(schedule_id), _) => {
                let event = Event::ScheduleDeleted {
                    group_id,
                    schedule_id,
                };
                self.persist_and_apply(&mut guard, vec![event]).await?;
            }
            (ScheduleChange::Relocate, Some(schedule_id), Some(new)) => {
                let event = Event::ScheduleRelocated {
                    group_id,
                    schedule_id,
                    location: new.location,
                };
                self.persist_and_apply(&mut guard, vec![event]).await?;
            }
            (ScheduleChange::Create | ScheduleChange::Regenerate, _, Some(mut new)) => {
                let tz = require_time_zone(&course)?;
                let started = Instant::now();
                let candidates = self.generate_checked(&course, tz, &new)?;
                let checked = check_no_schedule_conflict(&guard, &candidates, tz);
                metrics::histogram!(crate::observability::GENERATION_DURATION_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                checked?;
                new.id = Ulid::new();
                self.materialize(&mut guard, new, candidates).await?;
            }
            _ => {}
        }

        metrics::counter!(crate::observability::RECONCILIATIONS_TOTAL, "path" => change.label())
            .increment(1);
        info!("group {group_id}: schedule {}", change.label());
        Ok(change)
    }

    /// Generate sessions for a rule without persisting anything.
    pub async fn preview_sessions(&self, rule: &RecurrenceRule) -> Result<Vec<Candidate>, EngineError> {
        validate_rule(rule)?;
        let course = self.course.read().await;
        let tz = require_time_zone(&course)?;
        self.generate_checked(&course, tz, rule)
    }

    pub(crate) fn generate_checked(
        &self,
        course: &CourseState,
        tz: Tz,
        rule: &RecurrenceRule,
    ) -> Result<Vec<Candidate>, EngineError> {
        let candidates = generate_sessions(&tz, course, rule);
        if candidates.len() > MAX_SESSIONS_PER_SCHEDULE {
            return Err(EngineError::LimitExceeded("schedule produces too many sessions"));
        }
        Ok(candidates)
    }

    /// Persist `rule` and its candidates as the group's generated session set,
    /// superseding the group's current rule and the sessions it generated.
    /// One journal record: readers see the old set or the new one, never a mix.
    pub(crate) async fn materialize(
        &self,
        gs: &mut GroupState,
        rule: RecurrenceRule,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Session>, EngineError> {
        let sessions: Vec<Session> = candidates
            .into_iter()
            .map(|c| c.into_session(Ulid::new(), gs.id, rule.id))
            .collect();
        let count = sessions.len();
        let event = Event::ScheduleMaterialized {
            group_id: gs.id,
            schedule: rule,
            replaced: gs.schedule.as_ref().map(|r| r.id),
            sessions: sessions.clone(),
        };
        self.persist_and_apply(gs, vec![event]).await?;
        metrics::counter!(crate::observability::SESSIONS_GENERATED_TOTAL).increment(count as u64);
        tracing::debug!("group {}: materialized {count} sessions", gs.id);
        Ok(sessions)
    }
}
