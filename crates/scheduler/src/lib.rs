pub mod cron_service;

pub use cron_service::{
    normalize_crontab, resolve_timezone, CronService, ScheduledFire,
};
