pub use super::jobs::Entity as Jobs;
pub use super::schedules::Entity as Schedules;
