use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::cancellation::{rederive, status_for, FreePeriodResolver};
use super::conflict::{check_no_session_overlap, validate_location, validate_rule, validate_span};
use super::{require_time_zone, Engine, EngineError, JournalCommand};

/// Free periods of a course as they will be once `excluded` is gone.
struct Without<'a> {
    course: &'a CourseState,
    excluded: Ulid,
}

impl FreePeriodResolver for Without<'_> {
    fn first_overlapping(&self, span: &Span) -> Option<&FreePeriod> {
        self.course
            .overlapping_free_periods(span)
            .find(|p| p.id != self.excluded)
    }
}

/// Free periods of a course as they will be once `added` is stored.
struct With<'a> {
    course: &'a CourseState,
    added: &'a FreePeriod,
}

impl FreePeriodResolver for With<'_> {
    fn first_overlapping(&self, span: &Span) -> Option<&FreePeriod> {
        let existing = self.course.first_overlapping(span);
        let added = self.added.span.overlaps(span).then_some(self.added);
        match (existing, added) {
            (Some(e), Some(a)) => Some(if (a.span.start, a.id) < (e.span.start, e.id) { a } else { e }),
            (e, a) => e.or(a),
        }
    }
}

fn session_span(tz: &Tz, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidSession("start time must be before end time"));
    }
    let span = Span {
        start: zoned_ms(tz, date, start),
        end: zoned_ms(tz, date, end),
    };
    // Both ends can fold into the same instant around a DST switch.
    validate_span(&span)?;
    Ok(span)
}

fn normalize_explanation(explanation: Option<String>) -> Result<Option<String>, EngineError> {
    let explanation = explanation
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty());
    if explanation.as_ref().is_some_and(|e| e.len() > MAX_EXPLANATION_LEN) {
        return Err(EngineError::LimitExceeded("status explanation too long"));
    }
    Ok(explanation)
}

impl Engine {
    // ── Course ───────────────────────────────────────────────

    /// Set the IANA time zone every schedule of the course is interpreted in.
    /// Already generated sessions keep their instants.
    pub async fn configure_course(&self, time_zone: &str) -> Result<(), EngineError> {
        if time_zone.parse::<Tz>().is_err() {
            return Err(EngineError::UnknownTimeZone(time_zone.to_string()));
        }
        let mut course = self.course.write().await;
        let event = Event::CourseConfigured {
            time_zone: time_zone.to_string(),
        };
        self.journal_commit(vec![event.clone()]).await?;
        self.apply_course_event(&mut course, &event);
        tracing::info!("course {}: time zone {time_zone}", self.id);
        Ok(())
    }

    // ── Tutorial groups ──────────────────────────────────────

    /// Create a tutorial group, optionally with a recurrence rule.
    ///
    /// A new group has no sessions, so its rule cannot conflict; the group and
    /// its generated sessions land in one journal record.
    pub async fn create_group(
        &self,
        id: Ulid,
        title: String,
        rule: Option<RecurrenceRule>,
    ) -> Result<Vec<Session>, EngineError> {
        if title.len() > MAX_TITLE_LEN {
            return Err(EngineError::LimitExceeded("group title too long"));
        }
        if let Some(ref r) = rule {
            validate_rule(r)?;
        }
        let course = self.course.write().await;
        if self.groups.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.groups.len() >= MAX_GROUPS_PER_COURSE {
            return Err(EngineError::LimitExceeded("too many tutorial groups"));
        }

        let mut gs = GroupState::new(id, title.clone());
        let mut events = vec![Event::GroupCreated { id, title }];
        if let Some(mut rule) = rule {
            let tz = require_time_zone(&course)?;
            let candidates = self.generate_checked(&course, tz, &rule)?;
            rule.id = Ulid::new();
            let sessions = candidates
                .into_iter()
                .map(|c| c.into_session(Ulid::new(), id, rule.id))
                .collect();
            events.push(Event::ScheduleMaterialized {
                group_id: id,
                schedule: rule,
                sessions,
                replaced: None,
            });
        }

        self.journal_commit(events.clone()).await?;
        for event in &events {
            self.apply_group_event(&mut gs, event);
        }
        let sessions = gs.sessions.clone();
        if !sessions.is_empty() {
            metrics::counter!(crate::observability::SESSIONS_GENERATED_TOTAL)
                .increment(sessions.len() as u64);
        }
        self.groups.insert(id, Arc::new(RwLock::new(gs)));
        tracing::info!("course {}: created group {id}", self.id);
        Ok(sessions)
    }

    /// Copy a group from another course: fresh group id, fresh rule id,
    /// sessions generated in this course's time zone and free periods.
    pub async fn import_group(
        &self,
        title: String,
        rule: Option<RecurrenceRule>,
    ) -> Result<Ulid, EngineError> {
        let id = Ulid::new();
        self.create_group(id, title, rule).await?;
        Ok(id)
    }

    /// Delete a group together with its rule and all of its sessions.
    pub async fn delete_group(&self, id: Ulid) -> Result<(), EngineError> {
        let _course = self.course.write().await;
        let gs = self.get_group(&id).ok_or(EngineError::NotFound(id))?;
        let guard = gs.write().await;
        let event = Event::GroupDeleted { id };
        self.journal_commit(vec![event.clone()]).await?;
        self.unindex_sessions(&guard);
        self.groups.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        tracing::info!("course {}: deleted group {id}", self.id);
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────

    /// Add a one-off session to a group. Times are wall-clock in the course time zone.
    pub async fn create_session(
        &self,
        id: Ulid,
        group_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        location: String,
    ) -> Result<Session, EngineError> {
        validate_location(&location)?;
        let course = self.course.read().await;
        let tz = require_time_zone(&course)?;
        let span = session_span(&tz, date, start_time, end_time)?;
        let gs = self
            .get_group(&group_id)
            .ok_or(EngineError::NotFound(group_id))?;
        let mut guard = gs.write().await;
        if self.get_group_for_session(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.sessions.len() >= MAX_SESSIONS_PER_GROUP {
            return Err(EngineError::LimitExceeded("too many sessions in group"));
        }
        check_no_session_overlap(&guard, &span, None, tz)?;

        let session = Session {
            id,
            group_id,
            schedule_id: None,
            span,
            location,
            status: status_for(course.first_overlapping(&span)),
            attendance_count: None,
        };
        self.persist_and_apply(&mut guard, vec![Event::SessionCreated { session: session.clone() }])
            .await?;
        Ok(session)
    }

    /// Move a session or change its location.
    ///
    /// A generated session stops following its rule once edited, so it is
    /// detached and treated as individual from then on. Status is re-derived
    /// from the free periods at the new time; attendance is kept.
    pub async fn update_session(
        &self,
        id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        location: String,
    ) -> Result<Session, EngineError> {
        validate_location(&location)?;
        let course = self.course.read().await;
        let tz = require_time_zone(&course)?;
        let span = session_span(&tz, date, start_time, end_time)?;
        let mut guard = self.resolve_session_write(&id).await?;
        check_no_session_overlap(&guard, &span, Some(id), tz)?;

        let Some(existing) = guard.session(&id) else {
            return Err(EngineError::NotFound(id));
        };
        let session = Session {
            schedule_id: None,
            span,
            location,
            status: status_for(course.first_overlapping(&span)),
            ..existing.clone()
        };
        self.persist_and_apply(&mut guard, vec![Event::SessionUpdated { session: session.clone() }])
            .await?;
        Ok(session)
    }

    pub async fn delete_session(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _course = self.course.read().await;
        let mut guard = self.resolve_session_write(&id).await?;
        let group_id = guard.id;
        self.persist_and_apply(&mut guard, vec![Event::SessionDeleted { group_id, id }])
            .await?;
        Ok(group_id)
    }

    /// Manually cancel a session. Blank explanations are dropped.
    pub async fn cancel_session(
        &self,
        id: Ulid,
        explanation: Option<String>,
    ) -> Result<Session, EngineError> {
        let explanation = normalize_explanation(explanation)?;
        self.set_manual_status(
            id,
            SessionStatus::Cancelled {
                explanation,
                free_period_id: None,
            },
        )
        .await
    }

    pub async fn activate_session(&self, id: Ulid) -> Result<Session, EngineError> {
        self.set_manual_status(id, SessionStatus::Active).await
    }

    async fn set_manual_status(&self, id: Ulid, status: SessionStatus) -> Result<Session, EngineError> {
        let _course = self.course.read().await;
        let mut guard = self.resolve_session_write(&id).await?;
        let Some(current) = guard.session(&id) else {
            return Err(EngineError::NotFound(id));
        };
        // Only removing the free period may reactivate such a session.
        if let Some(period) = current.status.free_period_id() {
            return Err(EngineError::CancelledByFreePeriod(period));
        }
        let group_id = guard.id;
        let event = Event::SessionStatusChanged { group_id, id, status };
        self.persist_and_apply(&mut guard, vec![event]).await?;
        guard.session(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn record_attendance(&self, id: Ulid, count: Option<u32>) -> Result<(), EngineError> {
        if count.is_some_and(|c| c > MAX_ATTENDANCE_COUNT) {
            return Err(EngineError::LimitExceeded("attendance count too high"));
        }
        let _course = self.course.read().await;
        let mut guard = self.resolve_session_write(&id).await?;
        let group_id = guard.id;
        self.persist_and_apply(&mut guard, vec![Event::AttendanceRecorded { group_id, id, count }])
            .await
    }

    // ── Free periods ─────────────────────────────────────────

    /// Add a course-wide free period and re-derive every session it overlaps.
    /// Returns the number of sessions whose status changed.
    pub async fn add_free_period(
        &self,
        id: Ulid,
        span: Span,
        reason: Option<String>,
    ) -> Result<usize, EngineError> {
        validate_span(&span)?;
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("free period reason too long"));
        }
        let mut course = self.course.write().await;
        if course.free_periods.iter().any(|p| p.id == id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if course.free_periods.len() >= MAX_FREE_PERIODS_PER_COURSE {
            return Err(EngineError::LimitExceeded("too many free periods"));
        }

        let period = FreePeriod { id, span, reason };
        let mut guards = self.lock_all_groups().await;

        // Sessions already cancelled by an earlier-starting period stay linked to it.
        let resolver = With {
            course: &course,
            added: &period,
        };
        let mut changes = Vec::new();
        for guard in &guards {
            for s in guard.overlapping(&span) {
                if let Some(status) = rederive(s, &resolver) {
                    changes.push(Event::SessionStatusChanged {
                        group_id: guard.id,
                        id: s.id,
                        status,
                    });
                }
            }
        }
        let mut events = vec![Event::FreePeriodAdded { period }];
        events.extend(changes);
        let changed = events.len() - 1;
        self.journal_commit(events.clone()).await?;
        self.apply_course_wide(&mut course, &mut guards, &events);
        tracing::info!("course {}: free period {id} cancelled {changed} session(s)", self.id);
        Ok(changed)
    }

    /// Remove a free period. Sessions it cancelled fall back to whatever the
    /// remaining free periods say, which is active unless another one overlaps.
    pub async fn remove_free_period(&self, id: Ulid) -> Result<usize, EngineError> {
        let mut course = self.course.write().await;
        if !course.free_periods.iter().any(|p| p.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let mut guards = self.lock_all_groups().await;

        let remaining = Without {
            course: &course,
            excluded: id,
        };
        let mut events = vec![Event::FreePeriodRemoved { id }];
        for guard in &guards {
            for s in guard.sessions.iter().filter(|s| s.status.free_period_id() == Some(id)) {
                if let Some(status) = rederive(s, &remaining) {
                    events.push(Event::SessionStatusChanged {
                        group_id: guard.id,
                        id: s.id,
                        status,
                    });
                }
            }
        }
        let changed = events.len() - 1;
        self.journal_commit(events.clone()).await?;
        self.apply_course_wide(&mut course, &mut guards, &events);
        tracing::info!("course {}: free period {id} removed, {changed} session(s) re-derived", self.id);
        Ok(changed)
    }

    /// Write-lock every group in ascending id order. Caller holds the course write lock.
    async fn lock_all_groups(&self) -> Vec<tokio::sync::OwnedRwLockWriteGuard<GroupState>> {
        let mut ids: Vec<Ulid> = self.groups.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for gid in ids {
            if let Some(gs) = self.get_group(&gid) {
                guards.push(gs.write_owned().await);
            }
        }
        guards
    }

    fn apply_course_wide(
        &self,
        course: &mut CourseState,
        guards: &mut [tokio::sync::OwnedRwLockWriteGuard<GroupState>],
        events: &[Event],
    ) {
        for event in events {
            match event.group_id() {
                None => self.apply_course_event(course, event),
                Some(gid) => {
                    if let Some(guard) = guards.iter_mut().find(|g| g.id == gid) {
                        self.apply_group_event(guard, event);
                    }
                }
            }
        }
    }

    // ── Journal maintenance ──────────────────────────────────

    /// Rewrite the journal with the minimal events that rebuild the current state.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        // Every mutation holds the course lock, so the write lock freezes the state.
        let course = self.course.write().await;
        let mut events = Vec::new();

        if let Some(tz) = course.time_zone {
            events.push(Event::CourseConfigured {
                time_zone: tz.name().to_string(),
            });
        }
        for period in &course.free_periods {
            events.push(Event::FreePeriodAdded {
                period: period.clone(),
            });
        }

        let mut ids: Vec<Ulid> = self.groups.iter().map(|e| *e.key()).collect();
        ids.sort();
        for gid in ids {
            let Some(gs) = self.get_group(&gid) else {
                continue;
            };
            let guard = gs.read().await;
            events.push(Event::GroupCreated {
                id: guard.id,
                title: guard.title.clone(),
            });
            if let Some(rule) = &guard.schedule {
                events.push(Event::ScheduleMaterialized {
                    group_id: guard.id,
                    schedule: rule.clone(),
                    sessions: guard.sessions_of_schedule(rule.id).cloned().collect(),
                    replaced: None,
                });
            }
            let current_rule = guard.schedule.as_ref().map(|r| r.id);
            for s in &guard.sessions {
                if s.schedule_id.is_none() || s.schedule_id != current_rule {
                    events.push(Event::SessionCreated { session: s.clone() });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.journal_request(JournalCommand::Compact {
            events,
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))?;
        metrics::counter!(crate::observability::COMPACTIONS_TOTAL).increment(1);
        tracing::info!("course {}: journal compacted to {count} events", self.id);
        Ok(())
    }

    pub async fn records_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_request(JournalCommand::RecordsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
