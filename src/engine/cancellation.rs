use crate::model::*;

/// Answers "which free period, if any, does this time range fall into?".
pub trait FreePeriodResolver {
    fn first_overlapping(&self, span: &Span) -> Option<&FreePeriod>;
}

impl FreePeriodResolver for CourseState {
    fn first_overlapping(&self, span: &Span) -> Option<&FreePeriod> {
        self.overlapping_free_periods(span).next()
    }
}

/// Status of a session given the free period it overlaps.
///
/// A free period cancels the session and replaces any manual explanation.
/// Without one the session is active. Re-applying with the same input yields
/// the same status.
pub fn status_for(period: Option<&FreePeriod>) -> SessionStatus {
    match period {
        Some(p) => SessionStatus::Cancelled {
            explanation: None,
            free_period_id: Some(p.id),
        },
        None => SessionStatus::Active,
    }
}

/// Re-derive the status of an existing session. `None` if nothing would change.
pub fn rederive(session: &Session, resolver: &impl FreePeriodResolver) -> Option<SessionStatus> {
    let status = status_for(resolver.first_overlapping(&session.span));
    (status != session.status).then_some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn course_with(periods: &[(Ulid, Ms, Ms)]) -> CourseState {
        let mut c = CourseState::new(Ulid::new());
        for &(id, start, end) in periods {
            c.insert_free_period(FreePeriod {
                id,
                span: Span::new(start, end),
                reason: None,
            });
        }
        c
    }

    fn session(start: Ms, end: Ms, status: SessionStatus) -> Session {
        Session {
            id: Ulid::new(),
            group_id: Ulid::new(),
            schedule_id: None,
            span: Span::new(start, end),
            location: "room".into(),
            status,
            attendance_count: Some(12),
        }
    }

    #[test]
    fn free_period_cancels_and_clears_explanation() {
        let fp = Ulid::new();
        let course = course_with(&[(fp, 0, 1_000)]);
        let s = session(
            100,
            200,
            SessionStatus::Cancelled {
                explanation: Some("tutor ill".into()),
                free_period_id: None,
            },
        );
        let status = rederive(&s, &course).unwrap();
        assert_eq!(
            status,
            SessionStatus::Cancelled {
                explanation: None,
                free_period_id: Some(fp),
            }
        );
    }

    #[test]
    fn no_free_period_means_active() {
        let course = course_with(&[]);
        let s = session(
            100,
            200,
            SessionStatus::Cancelled {
                explanation: None,
                free_period_id: Some(Ulid::new()),
            },
        );
        assert_eq!(rederive(&s, &course), Some(SessionStatus::Active));
    }

    #[test]
    fn rederive_is_idempotent() {
        let fp = Ulid::new();
        let course = course_with(&[(fp, 0, 1_000)]);
        let mut s = session(100, 200, SessionStatus::Active);
        s.status = rederive(&s, &course).unwrap();
        assert_eq!(rederive(&s, &course), None);
    }

    #[test]
    fn earliest_starting_period_wins() {
        let first = Ulid::new();
        let second = Ulid::new();
        let course = course_with(&[(second, 150, 900), (first, 50, 500)]);
        let s = session(100, 200, SessionStatus::Active);
        assert_eq!(rederive(&s, &course).unwrap().free_period_id(), Some(first));
    }

    #[test]
    fn adjacent_period_does_not_cancel() {
        let course = course_with(&[(Ulid::new(), 200, 300)]);
        let s = session(100, 200, SessionStatus::Active);
        assert_eq!(rederive(&s, &course), None);
    }
}
