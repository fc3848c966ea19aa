use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

use crate::compactor;
use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::notify::NotifyHub;

/// Open course engines. Each course gets its own Engine + journal + compactor.
pub struct CourseRegistry {
    engines: DashMap<Ulid, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl CourseRegistry {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    pub fn journal_path(&self, course_id: Ulid) -> PathBuf {
        self.data_dir.join(format!("{course_id}.journal"))
    }

    /// Get the engine of a course, opening (and replaying) its journal on first use.
    pub fn get_or_open(&self, course_id: Ulid) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(&course_id) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_COURSES {
            return Err(std::io::Error::other("too many open courses"));
        }

        let engine = match self.engines.entry(course_id) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(
                    course_id,
                    self.journal_path(course_id),
                    notify,
                )?);
                slot.insert(engine.clone());
                engine
            }
        };

        let threshold = self.compact_threshold;
        tokio::spawn(compactor::run_compactor(Arc::downgrade(&engine), threshold));

        metrics::gauge!(crate::observability::COURSES_OPEN).set(self.engines.len() as f64);
        tracing::debug!("opened course {course_id}");
        Ok(engine)
    }

    /// Copy every tutorial group of `from` into `to`.
    ///
    /// Copies get new ids and keep their titles. Rules are regenerated in the
    /// target course's time zone against its free periods; sessions are not
    /// copied. Returns the ids of the new groups.
    ///
    /// Time zone and group capacity are checked before anything is written.
    /// Each copied group is then committed on its own, so a journal failure
    /// midway leaves the groups copied so far in place.
    pub async fn import_tutorial_groups(&self, from: Ulid, to: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let source = self.open(from)?;
        let target = self.open(to)?;

        let groups = source.list_groups().await;
        // Refuse up front rather than stop halfway through.
        if groups.iter().any(|g| g.schedule.is_some()) && target.time_zone().await.is_none() {
            return Err(EngineError::NoTimeZone);
        }
        check_import_capacity(target.list_groups().await.len(), groups.len())?;

        let mut created = Vec::with_capacity(groups.len());
        for group in groups {
            created.push(target.import_group(group.title, group.schedule).await?);
        }
        tracing::info!("imported {} group(s) from course {from} into {to}", created.len());
        Ok(created)
    }

    fn open(&self, course_id: Ulid) -> Result<Arc<Engine>, EngineError> {
        self.get_or_open(course_id)
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }
}

fn check_import_capacity(existing: usize, incoming: usize) -> Result<(), EngineError> {
    if existing + incoming > MAX_GROUPS_PER_COURSE {
        return Err(EngineError::LimitExceeded("too many tutorial groups"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::fs;

    use crate::model::*;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorsched_test_registry").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn thursday_rule() -> RecurrenceRule {
        RecurrenceRule {
            id: Ulid::new(),
            day_of_week: 4,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            valid_from: NaiveDate::from_ymd_opt(2025, 4, 22).unwrap(),
            valid_to: NaiveDate::from_ymd_opt(2025, 5, 22).unwrap(),
            repetition_frequency: 1,
            location: "Room 1".into(),
        }
    }

    #[tokio::test]
    async fn courses_are_isolated() {
        let reg = CourseRegistry::new(test_data_dir("isolation"), 1000);
        let a = reg.get_or_open(Ulid::new()).unwrap();
        let b = reg.get_or_open(Ulid::new()).unwrap();

        a.configure_course("Europe/Berlin").await.unwrap();
        let group = Ulid::new();
        a.create_group(group, "T".into(), None).await.unwrap();

        assert_eq!(b.time_zone().await, None);
        assert!(b.list_groups().await.is_empty());
        assert!(b.get_schedule(group).await.is_err());
    }

    #[tokio::test]
    async fn lazy_open_creates_journal() {
        let dir = test_data_dir("lazy");
        let reg = CourseRegistry::new(dir.clone(), 1000);
        assert!(fs::read_dir(&dir).unwrap().next().is_none());

        let course = Ulid::new();
        let _engine = reg.get_or_open(course).unwrap();
        assert!(dir.join(format!("{course}.journal")).exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let reg = CourseRegistry::new(test_data_dir("same"), 1000);
        let course = Ulid::new();
        let e1 = reg.get_or_open(course).unwrap();
        let e2 = reg.get_or_open(course).unwrap();
        assert!(Arc::ptr_eq(&e1, &e2));
    }

    #[tokio::test]
    async fn import_regenerates_in_target_time_zone() {
        let reg = CourseRegistry::new(test_data_dir("import"), 1000);
        let from = Ulid::new();
        let to = Ulid::new();
        let source = reg.get_or_open(from).unwrap();
        let target = reg.get_or_open(to).unwrap();
        source.configure_course("Europe/Berlin").await.unwrap();
        target.configure_course("America/New_York").await.unwrap();

        let with_rule = Ulid::new();
        source
            .create_group(with_rule, "Thursday".into(), Some(thursday_rule()))
            .await
            .unwrap();
        source
            .create_group(Ulid::new(), "No rule".into(), None)
            .await
            .unwrap();
        let single_group = source.list_groups().await;
        assert_eq!(single_group.len(), 2);

        let created = reg.import_tutorial_groups(from, to).await.unwrap();
        assert_eq!(created.len(), 2);
        assert!(!created.contains(&with_rule));

        let imported = target.list_groups().await;
        let copy = imported.iter().find(|g| g.title == "Thursday").unwrap();
        let source_rule = source.get_schedule(with_rule).await.unwrap().unwrap();
        let copied_rule = copy.schedule.clone().unwrap();
        assert_ne!(copied_rule.id, source_rule.id);
        assert!(copied_rule.same_timing(&source_rule));

        let sessions = target.list_sessions(copy.id).await.unwrap();
        let ny: chrono_tz::Tz = "America/New_York".parse().unwrap();
        assert_eq!(format_local(&ny, sessions[0].span.start), "2025-04-24 08:00");
        assert_eq!(sessions.len(), 5);

        let empty = imported.iter().find(|g| g.title == "No rule").unwrap();
        assert_eq!(empty.session_count, 0);
    }

    #[tokio::test]
    async fn import_requires_target_time_zone() {
        let reg = CourseRegistry::new(test_data_dir("import_no_tz"), 1000);
        let from = Ulid::new();
        let to = Ulid::new();
        let source = reg.get_or_open(from).unwrap();
        source.configure_course("Europe/Berlin").await.unwrap();
        source
            .create_group(Ulid::new(), "T".into(), Some(thursday_rule()))
            .await
            .unwrap();

        let result = reg.import_tutorial_groups(from, to).await;
        assert!(matches!(result, Err(EngineError::NoTimeZone)));
        assert!(reg.get_or_open(to).unwrap().list_groups().await.is_empty());
    }

    #[test]
    fn import_capacity_counts_existing_groups() {
        assert!(check_import_capacity(0, MAX_GROUPS_PER_COURSE).is_ok());
        assert!(check_import_capacity(MAX_GROUPS_PER_COURSE - 2, 2).is_ok());
        assert!(matches!(
            check_import_capacity(MAX_GROUPS_PER_COURSE - 1, 2),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
