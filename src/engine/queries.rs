use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn time_zone(&self) -> Option<Tz> {
        self.course.read().await.time_zone
    }

    /// All tutorial groups of the course, ordered by id.
    pub async fn list_groups(&self) -> Vec<GroupInfo> {
        let groups: Vec<_> = self.groups.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(groups.len());
        for gs in groups {
            let guard = gs.read().await;
            out.push(GroupInfo {
                id: guard.id,
                title: guard.title.clone(),
                schedule: guard.schedule.clone(),
                session_count: guard.sessions.len(),
            });
        }
        out.sort_by_key(|g| g.id);
        out
    }

    pub async fn get_schedule(&self, group_id: Ulid) -> Result<Option<RecurrenceRule>, EngineError> {
        let gs = self
            .get_group(&group_id)
            .ok_or(EngineError::NotFound(group_id))?;
        let guard = gs.read().await;
        Ok(guard.schedule.clone())
    }

    /// Every session of the group, generated and individual, ordered by start.
    pub async fn list_sessions(&self, group_id: Ulid) -> Result<Vec<Session>, EngineError> {
        let gs = self
            .get_group(&group_id)
            .ok_or(EngineError::NotFound(group_id))?;
        let guard = gs.read().await;
        Ok(guard.sessions.clone())
    }

    /// Sessions generated by the group's current rule. Empty without a rule.
    pub async fn sessions_of_schedule(&self, group_id: Ulid) -> Result<Vec<Session>, EngineError> {
        let gs = self
            .get_group(&group_id)
            .ok_or(EngineError::NotFound(group_id))?;
        let guard = gs.read().await;
        Ok(match &guard.schedule {
            Some(rule) => guard.sessions_of_schedule(rule.id).cloned().collect(),
            None => Vec::new(),
        })
    }

    pub async fn get_session(&self, id: Ulid) -> Result<Session, EngineError> {
        let group_id = self
            .get_group_for_session(&id)
            .ok_or(EngineError::NotFound(id))?;
        let gs = self
            .get_group(&group_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = gs.read().await;
        guard.session(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Free periods ordered by start.
    pub async fn list_free_periods(&self) -> Vec<FreePeriod> {
        self.course.read().await.free_periods.clone()
    }
}
