mod cancellation;
mod conflict;
mod error;
mod generator;
mod mutations;
mod queries;
mod reconcile;

pub use cancellation::{rederive, status_for, FreePeriodResolver};
pub use conflict::find_schedule_conflicts;
pub use error::EngineError;
pub use generator::{first_on_or_after, generate_sessions, Candidate};
pub use reconcile::{classify, ScheduleChange};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::journal::Journal;
use crate::model::*;
use crate::notify::NotifyHub;

pub type SharedGroupState = Arc<RwLock<GroupState>>;

// ── Group-commit journal channel ─────────────────────────

pub(crate) enum JournalCommand {
    Commit {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    RecordsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingCommit = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the journal and batches commits.
/// 1. Block until the first Commit arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Commits (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Commit { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Commit { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush what we have before a compaction or stats request.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut journal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_commit(&mut journal, other);
                }
            }
            other => handle_non_commit(&mut journal, other),
        }
    }
}

fn flush_and_respond(journal: &mut Journal, batch: &mut Vec<PendingCommit>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch.iter() {
        if let Err(e) = journal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = journal.flush_sync().err();
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    let failure = append_err.or(flush_err);
    for (_, tx) in batch.drain(..) {
        let r = match &failure {
            None => Ok(()),
            Some(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_commit(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_compact_file(journal.path(), &events)
                .and_then(|()| journal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::RecordsSinceCompact { response } => {
            let _ = response.send(journal.records_since_compact());
        }
        JournalCommand::Commit { .. } => unreachable!(),
    }
}

/// All scheduling state of one course.
///
/// Lock order: the course lock is always taken first (read for group-local
/// work, write for free periods and compaction), then group locks in
/// ascending id order.
pub struct Engine {
    pub id: Ulid,
    pub(crate) course: RwLock<CourseState>,
    pub(crate) groups: DashMap<Ulid, SharedGroupState>,
    journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: session id → tutorial group id
    session_to_group: DashMap<Ulid, Ulid>,
}

fn apply_to_course(cs: &mut CourseState, event: &Event) {
    match event {
        Event::CourseConfigured { time_zone } => match time_zone.parse::<Tz>() {
            Ok(tz) => cs.time_zone = Some(tz),
            Err(_) => tracing::warn!("course {}: ignoring unknown time zone {time_zone}", cs.id),
        },
        Event::FreePeriodAdded { period } => cs.insert_free_period(period.clone()),
        Event::FreePeriodRemoved { id } => {
            cs.remove_free_period(*id);
        }
        _ => {}
    }
}

/// Apply a group-scoped event (no locking; caller holds the group lock).
fn apply_to_group(gs: &mut GroupState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ScheduleMaterialized {
            schedule,
            sessions,
            replaced,
            ..
        } => {
            if let Some(old) = replaced {
                for s in gs.sessions_of_schedule(*old) {
                    index.remove(&s.id);
                }
                gs.remove_sessions_of_schedule(*old);
            }
            gs.schedule = Some(schedule.clone());
            for s in sessions {
                index.insert(s.id, gs.id);
                gs.insert_session(s.clone());
            }
        }
        Event::ScheduleRelocated {
            schedule_id,
            location,
            ..
        } => {
            if let Some(rule) = gs.schedule.as_mut().filter(|r| r.id == *schedule_id) {
                rule.location = location.clone();
            }
            for s in gs
                .sessions
                .iter_mut()
                .filter(|s| s.schedule_id == Some(*schedule_id))
            {
                s.location = location.clone();
            }
        }
        Event::ScheduleDeleted { schedule_id, .. } => {
            for s in gs.sessions_of_schedule(*schedule_id) {
                index.remove(&s.id);
            }
            gs.remove_sessions_of_schedule(*schedule_id);
            if gs.schedule.as_ref().is_some_and(|r| r.id == *schedule_id) {
                gs.schedule = None;
            }
        }
        Event::SessionCreated { session } => {
            index.insert(session.id, gs.id);
            gs.insert_session(session.clone());
        }
        Event::SessionUpdated { session } => {
            // Span may have moved; reinsert to keep the sort order.
            gs.remove_session(session.id);
            index.insert(session.id, gs.id);
            gs.insert_session(session.clone());
        }
        Event::SessionStatusChanged { id, status, .. } => {
            if let Some(s) = gs.session_mut(id) {
                s.status = status.clone();
            }
        }
        Event::AttendanceRecorded { id, count, .. } => {
            if let Some(s) = gs.session_mut(id) {
                s.attendance_count = *count;
            }
        }
        Event::SessionDeleted { id, .. } => {
            gs.remove_session(*id);
            index.remove(id);
        }
        // Group lifecycle is handled at the DashMap level, course events on CourseState.
        Event::GroupCreated { .. }
        | Event::GroupDeleted { .. }
        | Event::CourseConfigured { .. }
        | Event::FreePeriodAdded { .. }
        | Event::FreePeriodRemoved { .. } => {}
    }
}

impl Engine {
    /// Open the course engine, replaying its journal. Must run inside a Tokio runtime.
    pub fn new(id: Ulid, journal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (journal, events) = Journal::recover(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        // Replay into plain values first; nothing else can see them yet.
        let mut course = CourseState::new(id);
        let mut groups: HashMap<Ulid, GroupState> = HashMap::new();
        let session_to_group = DashMap::new();

        for event in &events {
            match event {
                Event::GroupCreated { id, title } => {
                    groups.insert(*id, GroupState::new(*id, title.clone()));
                }
                Event::GroupDeleted { id } => {
                    if let Some(gs) = groups.remove(id) {
                        for s in &gs.sessions {
                            session_to_group.remove(&s.id);
                        }
                    }
                }
                other => match other.group_id() {
                    Some(group_id) => {
                        if let Some(gs) = groups.get_mut(&group_id) {
                            apply_to_group(gs, other, &session_to_group);
                        }
                    }
                    None => apply_to_course(&mut course, other),
                },
            }
        }

        tracing::debug!(
            "course {id}: replayed {} events, {} groups",
            events.len(),
            groups.len()
        );

        Ok(Self {
            id,
            course: RwLock::new(course),
            groups: groups
                .into_iter()
                .map(|(gid, gs)| (gid, Arc::new(RwLock::new(gs))))
                .collect(),
            journal_tx,
            notify,
            session_to_group,
        })
    }

    /// Commit one transaction through the background group-commit writer.
    pub(crate) async fn journal_commit(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Commit {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub(crate) async fn journal_request(&self, cmd: JournalCommand) -> Result<(), EngineError> {
        self.journal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))
    }

    pub(crate) fn apply_course_event(&self, cs: &mut CourseState, event: &Event) {
        apply_to_course(cs, event);
        self.notify.send(self.id, event);
    }

    pub(crate) fn apply_group_event(&self, gs: &mut GroupState, event: &Event) {
        apply_to_group(gs, event, &self.session_to_group);
        self.notify.send(gs.id, event);
    }

    /// Journal-commit + apply + notify for a transaction touching one group.
    pub(crate) async fn persist_and_apply(
        &self,
        gs: &mut GroupState,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        self.journal_commit(events.clone()).await?;
        for event in &events {
            self.apply_group_event(gs, event);
        }
        Ok(())
    }

    pub fn get_group(&self, id: &Ulid) -> Option<SharedGroupState> {
        self.groups.get(id).map(|e| e.value().clone())
    }

    pub fn get_group_for_session(&self, session_id: &Ulid) -> Option<Ulid> {
        self.session_to_group.get(session_id).map(|e| *e.value())
    }

    pub(crate) fn unindex_sessions(&self, gs: &GroupState) {
        for s in &gs.sessions {
            self.session_to_group.remove(&s.id);
        }
    }

    /// Lookup session → group, acquire the group's write lock.
    pub(crate) async fn resolve_session_write(
        &self,
        session_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<GroupState>, EngineError> {
        let group_id = self
            .get_group_for_session(session_id)
            .ok_or(EngineError::NotFound(*session_id))?;
        let gs = self
            .get_group(&group_id)
            .ok_or(EngineError::NotFound(group_id))?;
        let guard = gs.write_owned().await;
        if guard.session(session_id).is_none() {
            return Err(EngineError::NotFound(*session_id));
        }
        Ok(guard)
    }
}

pub(crate) fn require_time_zone(course: &CourseState) -> Result<Tz, EngineError> {
    course.time_zone.ok_or(EngineError::NoTimeZone)
}
