use chrono::{NaiveDate, NaiveTime, TimeZone, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Time zone conversion ─────────────────────────────────────────

/// Interpret a wall-clock date + time in `tz`.
///
/// Ambiguous times (autumn fold) resolve to the earlier offset. Times inside a
/// spring-forward gap are pushed forward by the length of the gap.
pub fn zoned_ms(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Ms {
    let local = date.and_time(time);
    if let Some(dt) = tz.from_local_datetime(&local).earliest() {
        return dt.timestamp_millis();
    }
    let shifted = local + chrono::Duration::hours(1);
    match tz.from_local_datetime(&shifted).earliest() {
        Some(dt) => dt.timestamp_millis(),
        None => local.and_utc().timestamp_millis(),
    }
}

/// Render an instant as `YYYY-MM-DD HH:MM` in `tz`.
pub fn format_local(tz: &Tz, ms: Ms) -> String {
    match tz.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => format!("{ms}ms"),
    }
}

// ── Entities ─────────────────────────────────────────────────────

/// The weekly recurrence rule of a tutorial group. A group has at most one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub id: Ulid,
    /// 1 = Monday .. 7 = Sunday.
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
    /// Weeks between two occurrences.
    pub repetition_frequency: u32,
    pub location: String,
}

impl RecurrenceRule {
    pub fn weekday(&self) -> Option<Weekday> {
        match self.day_of_week {
            1..=7 => Weekday::try_from(self.day_of_week - 1).ok(),
            _ => None,
        }
    }

    /// True if both rules produce the same occurrences. Location and id are ignored.
    pub fn same_timing(&self, other: &RecurrenceRule) -> bool {
        self.day_of_week == other.day_of_week
            && self.start_time == other.start_time
            && self.end_time == other.end_time
            && self.valid_from == other.valid_from
            && self.valid_to == other.valid_to
            && self.repetition_frequency == other.repetition_frequency
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    /// Either cancelled by hand (optional explanation) or by a free period
    /// (the period is the explanation).
    Cancelled {
        explanation: Option<String>,
        free_period_id: Option<Ulid>,
    },
}

impl SessionStatus {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionStatus::Cancelled { .. })
    }

    pub fn free_period_id(&self) -> Option<Ulid> {
        match self {
            SessionStatus::Cancelled { free_period_id, .. } => *free_period_id,
            SessionStatus::Active => None,
        }
    }

    pub fn explanation(&self) -> Option<&str> {
        match self {
            SessionStatus::Cancelled { explanation, .. } => explanation.as_deref(),
            SessionStatus::Active => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Cancelled { .. } => "CANCELLED",
        }
    }
}

/// One concrete occurrence of a tutorial group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub group_id: Ulid,
    /// Rule that generated this session; `None` for individual sessions.
    pub schedule_id: Option<Ulid>,
    pub span: Span,
    pub location: String,
    pub status: SessionStatus,
    pub attendance_count: Option<u32>,
}

impl Session {
    pub fn is_individual(&self) -> bool {
        self.schedule_id.is_none()
    }
}

/// Course-wide period during which no tutorials take place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreePeriod {
    pub id: Ulid,
    pub span: Span,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GroupState {
    pub id: Ulid,
    pub title: String,
    pub schedule: Option<RecurrenceRule>,
    /// Generated and individual sessions, sorted by `span.start`.
    pub sessions: Vec<Session>,
}

impl GroupState {
    pub fn new(id: Ulid, title: String) -> Self {
        Self {
            id,
            title,
            schedule: None,
            sessions: Vec::new(),
        }
    }

    /// Insert session maintaining sort order by span.start.
    pub fn insert_session(&mut self, session: Session) {
        let pos = self
            .sessions
            .binary_search_by_key(&session.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.sessions.insert(pos, session);
    }

    pub fn remove_session(&mut self, id: Ulid) -> Option<Session> {
        let pos = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.remove(pos))
    }

    pub fn session(&self, id: &Ulid) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == *id)
    }

    pub fn session_mut(&mut self, id: &Ulid) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == *id)
    }

    /// Sessions whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Session> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .sessions
            .partition_point(|s| s.span.start < query.end);
        self.sessions[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    pub fn sessions_of_schedule(&self, schedule_id: Ulid) -> impl Iterator<Item = &Session> {
        self.sessions
            .iter()
            .filter(move |s| s.schedule_id == Some(schedule_id))
    }

    /// Drop every session generated by `schedule_id`. Returns how many were removed.
    pub fn remove_sessions_of_schedule(&mut self, schedule_id: Ulid) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.schedule_id != Some(schedule_id));
        before - self.sessions.len()
    }
}

#[derive(Debug, Clone)]
pub struct CourseState {
    pub id: Ulid,
    pub time_zone: Option<Tz>,
    /// Sorted by `span.start`.
    pub free_periods: Vec<FreePeriod>,
}

impl CourseState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            time_zone: None,
            free_periods: Vec::new(),
        }
    }

    pub fn insert_free_period(&mut self, period: FreePeriod) {
        let pos = self
            .free_periods
            .binary_search_by_key(&(period.span.start, period.id), |p| (p.span.start, p.id))
            .unwrap_or_else(|e| e);
        self.free_periods.insert(pos, period);
    }

    pub fn remove_free_period(&mut self, id: Ulid) -> Option<FreePeriod> {
        let pos = self.free_periods.iter().position(|p| p.id == id)?;
        Some(self.free_periods.remove(pos))
    }

    pub fn overlapping_free_periods(&self, query: &Span) -> impl Iterator<Item = &FreePeriod> {
        let right_bound = self
            .free_periods
            .partition_point(|p| p.span.start < query.end);
        self.free_periods[..right_bound]
            .iter()
            .filter(move |p| p.span.end > query.start)
    }
}

/// The journal record vocabulary. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourseConfigured {
        time_zone: String,
    },
    FreePeriodAdded {
        period: FreePeriod,
    },
    FreePeriodRemoved {
        id: Ulid,
    },
    GroupCreated {
        id: Ulid,
        title: String,
    },
    GroupDeleted {
        id: Ulid,
    },
    /// Replaces the group's rule and every session generated by `replaced`.
    ScheduleMaterialized {
        group_id: Ulid,
        schedule: RecurrenceRule,
        sessions: Vec<Session>,
        replaced: Option<Ulid>,
    },
    ScheduleRelocated {
        group_id: Ulid,
        schedule_id: Ulid,
        location: String,
    },
    ScheduleDeleted {
        group_id: Ulid,
        schedule_id: Ulid,
    },
    SessionCreated {
        session: Session,
    },
    SessionUpdated {
        session: Session,
    },
    SessionStatusChanged {
        group_id: Ulid,
        id: Ulid,
        status: SessionStatus,
    },
    AttendanceRecorded {
        group_id: Ulid,
        id: Ulid,
        count: Option<u32>,
    },
    SessionDeleted {
        group_id: Ulid,
        id: Ulid,
    },
}

impl Event {
    /// Tutorial group an event belongs to; `None` for course-level events.
    pub fn group_id(&self) -> Option<Ulid> {
        match self {
            Event::GroupCreated { id, .. } | Event::GroupDeleted { id } => Some(*id),
            Event::ScheduleMaterialized { group_id, .. }
            | Event::ScheduleRelocated { group_id, .. }
            | Event::ScheduleDeleted { group_id, .. }
            | Event::SessionStatusChanged { group_id, .. }
            | Event::AttendanceRecorded { group_id, .. }
            | Event::SessionDeleted { group_id, .. } => Some(*group_id),
            Event::SessionCreated { session } | Event::SessionUpdated { session } => {
                Some(session.group_id)
            }
            Event::CourseConfigured { .. }
            | Event::FreePeriodAdded { .. }
            | Event::FreePeriodRemoved { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub id: Ulid,
    pub title: String,
    pub schedule: Option<RecurrenceRule>,
    pub session_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(start: Ms, end: Ms, schedule_id: Option<Ulid>) -> Session {
        Session {
            id: Ulid::new(),
            group_id: Ulid::nil(),
            schedule_id,
            span: Span::new(start, end),
            location: "room".into(),
            status: SessionStatus::Active,
            attendance_count: None,
        }
    }

    fn rule() -> RecurrenceRule {
        RecurrenceRule {
            id: Ulid::new(),
            day_of_week: 1,
            start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            valid_from: NaiveDate::from_ymd_opt(2024, 10, 14).unwrap(),
            valid_to: NaiveDate::from_ymd_opt(2025, 2, 7).unwrap(),
            repetition_frequency: 1,
            location: "01.07.014".into(),
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert_eq!(a.duration_ms(), 100);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn weekday_mapping() {
        let mut r = rule();
        assert_eq!(r.weekday(), Some(Weekday::Mon));
        r.day_of_week = 7;
        assert_eq!(r.weekday(), Some(Weekday::Sun));
        r.day_of_week = 0;
        assert_eq!(r.weekday(), None);
        r.day_of_week = 8;
        assert_eq!(r.weekday(), None);
    }

    #[test]
    fn same_timing_ignores_location_and_id() {
        let a = rule();
        let mut b = a.clone();
        b.id = Ulid::new();
        b.location = "elsewhere".into();
        assert!(a.same_timing(&b));
        b.repetition_frequency = 2;
        assert!(!a.same_timing(&b));
    }

    #[test]
    fn sessions_stay_sorted() {
        let mut g = GroupState::new(Ulid::new(), "G1".into());
        g.insert_session(session(300, 400, None));
        g.insert_session(session(100, 200, None));
        g.insert_session(session(200, 300, None));
        let starts: Vec<Ms> = g.sessions.iter().map(|s| s.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_is_half_open() {
        let mut g = GroupState::new(Ulid::new(), "G1".into());
        g.insert_session(session(100, 200, None));
        g.insert_session(session(450, 600, None));
        g.insert_session(session(1000, 1100, None));

        let hits: Vec<_> = g.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));

        assert_eq!(g.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(g.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn remove_sessions_of_schedule_keeps_individual() {
        let schedule = Ulid::new();
        let mut g = GroupState::new(Ulid::new(), "G1".into());
        g.insert_session(session(100, 200, Some(schedule)));
        g.insert_session(session(300, 400, None));
        g.insert_session(session(500, 600, Some(schedule)));

        assert_eq!(g.sessions_of_schedule(schedule).count(), 2);
        assert_eq!(g.remove_sessions_of_schedule(schedule), 2);
        assert_eq!(g.sessions.len(), 1);
        assert!(g.sessions[0].is_individual());
    }

    #[test]
    fn remove_nonexistent_session_returns_none() {
        let mut g = GroupState::new(Ulid::new(), "G1".into());
        g.insert_session(session(100, 200, None));
        assert!(g.remove_session(Ulid::new()).is_none());
        assert_eq!(g.sessions.len(), 1);
    }

    #[test]
    fn free_period_lookup() {
        let mut c = CourseState::new(Ulid::new());
        let id = Ulid::new();
        c.insert_free_period(FreePeriod {
            id,
            span: Span::new(1_000, 5_000),
            reason: Some("Holiday".into()),
        });
        assert_eq!(c.overlapping_free_periods(&Span::new(4_000, 6_000)).count(), 1);
        assert_eq!(c.overlapping_free_periods(&Span::new(5_000, 6_000)).count(), 0);
        assert!(c.remove_free_period(id).is_some());
        assert!(c.free_periods.is_empty());
    }

    #[test]
    fn status_accessors() {
        let fp = Ulid::new();
        let s = SessionStatus::Cancelled {
            explanation: None,
            free_period_id: Some(fp),
        };
        assert!(s.is_cancelled());
        assert_eq!(s.free_period_id(), Some(fp));
        assert_eq!(s.label(), "CANCELLED");
        assert_eq!(SessionStatus::Active.free_period_id(), None);
        assert_eq!(SessionStatus::Active.explanation(), None);
    }

    #[test]
    fn zoned_conversion_uses_course_zone() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let time = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        // CEST = UTC+2
        let expected = date.and_hms_opt(8, 0, 0).unwrap().and_utc().timestamp_millis();
        assert_eq!(zoned_ms(&tz, date, time), expected);
        assert_eq!(format_local(&tz, expected), "2024-07-01 10:00");
    }

    #[test]
    fn zoned_conversion_skips_dst_gap() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        // 2024-03-31 02:30 does not exist in Berlin; it becomes 03:30 CEST.
        let date = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let ms = zoned_ms(&tz, date, NaiveTime::from_hms_opt(2, 30, 0).unwrap());
        assert_eq!(format_local(&tz, ms), "2024-03-31 03:30");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ScheduleMaterialized {
            group_id: Ulid::new(),
            schedule: rule(),
            sessions: vec![session(100, 200, None)],
            replaced: None,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
