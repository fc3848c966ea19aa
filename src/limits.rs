//! Hard limits on user-supplied input. Enforced at the engine boundary.

pub const MAX_COURSES: usize = 10_000;
pub const MAX_GROUPS_PER_COURSE: usize = 1_000;
pub const MAX_FREE_PERIODS_PER_COURSE: usize = 1_000;
/// Upper bound on occurrences a single rule may materialize.
pub const MAX_SESSIONS_PER_SCHEDULE: usize = 1_000;
pub const MAX_SESSIONS_PER_GROUP: usize = 5_000;

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_LOCATION_LEN: usize = 2_000;
pub const MAX_EXPLANATION_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 256;
pub const MAX_ATTENDANCE_COUNT: u32 = 3_000;
