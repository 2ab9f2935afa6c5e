pub mod assistant;
pub mod attendance;
pub mod backup_exchange;
pub mod core;
pub mod debriefs;
pub mod directory;
pub mod documents;
pub mod notifications;
pub mod schedule;
pub mod seed;
