use chrono::{Datelike, Days, NaiveDate, Weekday};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::MAX_SESSIONS_PER_SCHEDULE;
use crate::model::*;

use super::cancellation::{status_for, FreePeriodResolver};

/// A session the generator proposes. Has no identity until materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub span: Span,
    pub location: String,
    pub status: SessionStatus,
}

impl Candidate {
    pub fn into_session(self, id: Ulid, group_id: Ulid, schedule_id: Ulid) -> Session {
        Session {
            id,
            group_id,
            schedule_id: Some(schedule_id),
            span: self.span,
            location: self.location,
            status: self.status,
            attendance_count: None,
        }
    }
}

/// First date on or after `from` that falls on `weekday`.
pub fn first_on_or_after(from: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (7 + weekday.num_days_from_monday() - from.weekday().num_days_from_monday()) % 7;
    from + Days::new(u64::from(ahead))
}

/// Expand a recurrence rule into concrete sessions in the course time zone.
///
/// Occurrences start at the first matching weekday on or after `valid_from`
/// and repeat every `repetition_frequency` weeks while the occurrence date is
/// not after `valid_to`. Each occurrence overlapping a free period comes out
/// cancelled and linked to it. Pure: identical inputs give identical output.
///
/// Stops one past `MAX_SESSIONS_PER_SCHEDULE` so callers can detect oversized rules.
pub fn generate_sessions(
    tz: &Tz,
    free_periods: &impl FreePeriodResolver,
    rule: &RecurrenceRule,
) -> Vec<Candidate> {
    let Some(weekday) = rule.weekday() else {
        return Vec::new();
    };
    let step = Days::new(7 * u64::from(rule.repetition_frequency.max(1)));

    let mut candidates = Vec::new();
    let mut date = first_on_or_after(rule.valid_from, weekday);

    while date <= rule.valid_to && candidates.len() <= MAX_SESSIONS_PER_SCHEDULE {
        let start = zoned_ms(tz, date, rule.start_time);
        let end = zoned_ms(tz, date, rule.end_time);
        if start < end {
            let span = Span::new(start, end);
            candidates.push(Candidate {
                span,
                location: rule.location.clone(),
                status: status_for(free_periods.first_overlapping(&span)),
            });
        } else {
            // Only reachable when a DST gap swallows the whole slot.
            tracing::debug!("skipping {date}: slot collapses in {tz}");
        }
        date = match date.checked_add_days(step) {
            Some(next) => next,
            None => break,
        };
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn berlin() -> Tz {
        "Europe/Berlin".parse().unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn monday_rule(valid_from: NaiveDate, valid_to: NaiveDate) -> RecurrenceRule {
        RecurrenceRule {
            id: Ulid::new(),
            day_of_week: 1,
            start_time: t(10, 0),
            end_time: t(12, 0),
            valid_from,
            valid_to,
            repetition_frequency: 1,
            location: "01.07.014".into(),
        }
    }

    fn no_free_periods() -> CourseState {
        CourseState::new(Ulid::new())
    }

    fn local_dates(tz: &Tz, candidates: &[Candidate]) -> Vec<String> {
        candidates
            .iter()
            .map(|c| format_local(tz, c.span.start))
            .collect()
    }

    #[test]
    fn anchor_moves_to_next_matching_weekday() {
        assert_eq!(first_on_or_after(d(2024, 10, 16), Weekday::Mon), d(2024, 10, 21));
        assert_eq!(first_on_or_after(d(2024, 10, 14), Weekday::Mon), d(2024, 10, 14));
        assert_eq!(first_on_or_after(d(2024, 10, 20), Weekday::Sun), d(2024, 10, 20));
        assert_eq!(first_on_or_after(d(2024, 10, 21), Weekday::Sun), d(2024, 10, 27));
    }

    #[test]
    fn wednesday_start_five_weeks_gives_five_mondays() {
        let tz = berlin();
        // 2024-10-16 is a Wednesday.
        let rule = monday_rule(d(2024, 10, 16), d(2024, 11, 20));
        let sessions = generate_sessions(&tz, &no_free_periods(), &rule);
        assert_eq!(
            local_dates(&tz, &sessions),
            vec![
                "2024-10-21 10:00",
                "2024-10-28 10:00",
                "2024-11-04 10:00",
                "2024-11-11 10:00",
                "2024-11-18 10:00",
            ]
        );
        assert!(sessions.iter().all(|s| s.status == SessionStatus::Active));
        assert!(sessions.iter().all(|s| s.location == "01.07.014"));
    }

    #[test]
    fn window_boundaries_are_inclusive() {
        let tz = berlin();
        let rule = monday_rule(d(2024, 10, 14), d(2024, 10, 28));
        let sessions = generate_sessions(&tz, &no_free_periods(), &rule);
        assert_eq!(
            local_dates(&tz, &sessions),
            vec!["2024-10-14 10:00", "2024-10-21 10:00", "2024-10-28 10:00"]
        );
    }

    #[test]
    fn short_window_yields_zero_or_one() {
        let tz = berlin();
        // Tue..Sat contains no Monday.
        let none = monday_rule(d(2024, 10, 15), d(2024, 10, 19));
        assert!(generate_sessions(&tz, &no_free_periods(), &none).is_empty());
        // Sat..Thu contains exactly one Monday.
        let one = monday_rule(d(2024, 10, 19), d(2024, 10, 24));
        assert_eq!(generate_sessions(&tz, &no_free_periods(), &one).len(), 1);
    }

    #[test]
    fn repetition_frequency_spaces_occurrences() {
        let tz = berlin();
        let mut rule = monday_rule(d(2024, 10, 14), d(2024, 11, 30));
        rule.repetition_frequency = 2;
        let sessions = generate_sessions(&tz, &no_free_periods(), &rule);
        assert_eq!(
            local_dates(&tz, &sessions),
            vec!["2024-10-14 10:00", "2024-10-28 10:00", "2024-11-11 10:00", "2024-11-25 10:00"]
        );
    }

    #[test]
    fn wall_clock_time_survives_dst_change() {
        let tz = berlin();
        // Berlin leaves summer time on 2024-10-27.
        let rule = monday_rule(d(2024, 10, 21), d(2024, 10, 28));
        let sessions = generate_sessions(&tz, &no_free_periods(), &rule);
        assert_eq!(
            local_dates(&tz, &sessions),
            vec!["2024-10-21 10:00", "2024-10-28 10:00"]
        );
        // One extra hour of absolute time between the two.
        let week_ms = 7 * 24 * 3_600_000;
        assert_eq!(sessions[1].span.start - sessions[0].span.start, week_ms + 3_600_000);
        assert_eq!(sessions[0].span.duration_ms(), 2 * 3_600_000);
    }

    #[test]
    fn free_period_cancels_third_occurrence() {
        let tz = berlin();
        let rule = monday_rule(d(2024, 10, 16), d(2024, 11, 20));
        let fp = Ulid::new();
        let mut course = no_free_periods();
        course.insert_free_period(FreePeriod {
            id: fp,
            span: Span::new(
                zoned_ms(&tz, d(2024, 11, 4), t(0, 0)),
                zoned_ms(&tz, d(2024, 11, 5), t(0, 0)),
            ),
            reason: Some("Dies academicus".into()),
        });

        let sessions = generate_sessions(&tz, &course, &rule);
        assert_eq!(sessions.len(), 5);
        let cancelled: Vec<_> = sessions.iter().filter(|s| s.status.is_cancelled()).collect();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(format_local(&tz, cancelled[0].span.start), "2024-11-04 10:00");
        assert_eq!(cancelled[0].status.free_period_id(), Some(fp));
        assert_eq!(cancelled[0].status.explanation(), None);
    }

    #[test]
    fn generation_is_deterministic() {
        let tz = berlin();
        let rule = monday_rule(d(2024, 10, 1), d(2025, 2, 1));
        let a = generate_sessions(&tz, &no_free_periods(), &rule);
        let b = generate_sessions(&tz, &no_free_periods(), &rule);
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn time_zone_is_honoured() {
        let rule = monday_rule(d(2024, 10, 14), d(2024, 10, 14));
        let berlin = generate_sessions(&berlin(), &no_free_periods(), &rule);
        let tokyo_tz: Tz = "Asia/Tokyo".parse().unwrap();
        let tokyo = generate_sessions(&tokyo_tz, &no_free_periods(), &rule);
        // Berlin is UTC+2 in October, Tokyo UTC+9.
        assert_eq!(berlin[0].span.start - tokyo[0].span.start, 7 * 3_600_000);
    }

    #[test]
    fn oversized_rule_stops_one_past_limit() {
        let tz = berlin();
        let rule = monday_rule(d(2000, 1, 3), d(2100, 1, 1));
        let sessions = generate_sessions(&tz, &no_free_periods(), &rule);
        assert_eq!(sessions.len(), MAX_SESSIONS_PER_SCHEDULE + 1);
    }

    #[test]
    fn into_session_links_rule_and_group() {
        let tz = berlin();
        let rule = monday_rule(d(2024, 10, 14), d(2024, 10, 14));
        let candidate = generate_sessions(&tz, &no_free_periods(), &rule).remove(0);
        let (id, group) = (Ulid::new(), Ulid::new());
        let session = candidate.clone().into_session(id, group, rule.id);
        assert_eq!(session.id, id);
        assert_eq!(session.group_id, group);
        assert_eq!(session.schedule_id, Some(rule.id));
        assert_eq!(session.span, candidate.span);
        assert_eq!(session.attendance_count, None);
    }
}
