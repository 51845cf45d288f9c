//! Minute-aligned crontab scheduler.
//!
//! One ticker wakes on every whole minute and walks the crontab matchers in
//! the registry. Expressions are the 5-field crontab form; each matcher may
//! carry its own IANA timezone, falling back to the configured default. A
//! match fires the owning skill directly with a tick event, bypassing the
//! ranker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use courier_core::{Error, Event, Matcher, MatcherKind, Result};
use courier_skills::SkillRegistry;

/// A crontab match ready to run.
#[derive(Debug)]
pub struct ScheduledFire {
    pub skill: String,
    pub event: Event,
}

/// Turns a 5-field crontab expression into the 6-field form the `cron`
/// crate parses, pinning the seconds field to 0.
pub fn normalize_crontab(expression: &str) -> String {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

/// Resolves a configured timezone name. "local" asks the host.
pub fn resolve_timezone(name: &str) -> Result<Tz> {
    let name = name.trim();
    if name.is_empty() || name.eq_ignore_ascii_case("utc") {
        return Ok(Tz::UTC);
    }
    if name.eq_ignore_ascii_case("local") {
        let host = iana_time_zone::get_timezone()
            .map_err(|e| Error::Config(format!("Cannot resolve host timezone: {}", e)))?;
        return host
            .parse::<Tz>()
            .map_err(|e| Error::Config(format!("Host timezone {} unknown: {}", host, e)));
    }
    name.parse::<Tz>()
        .map_err(|e| Error::Config(format!("Unknown timezone {}: {}", name, e)))
}

fn truncate_to_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let next = truncate_to_minute(now) + chrono::Duration::minutes(1);
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}

pub struct CronService {
    registry: Arc<RwLock<SkillRegistry>>,
    timezone: Tz,
    fires: mpsc::Sender<ScheduledFire>,
    last_minute: Mutex<Option<DateTime<Utc>>>,
}

impl CronService {
    pub fn new(
        registry: Arc<RwLock<SkillRegistry>>,
        timezone: Tz,
        fires: mpsc::Sender<ScheduledFire>,
    ) -> Self {
        Self {
            registry,
            timezone,
            fires,
            last_minute: Mutex::new(None),
        }
    }

    /// Evaluates every crontab matcher against the minute containing `now`.
    /// A minute is evaluated at most once, so a skill fires at most once per
    /// matching minute no matter how often the ticker calls in.
    pub async fn run_tick(&self, now: DateTime<Utc>) {
        let minute = truncate_to_minute(now);
        {
            let mut last = self.last_minute.lock().await;
            if *last == Some(minute) {
                return;
            }
            *last = Some(minute);
        }

        let skills = {
            let registry = self.registry.read().await;
            registry.with_matcher_kind(MatcherKind::Crontab)
        };
        for skill in skills {
            for matcher in &skill.matchers {
                let (expression, timezone) = match matcher {
                    Matcher::Crontab { expression, timezone } => {
                        (expression.as_str(), timezone.as_deref())
                    }
                    _ => continue,
                };
                if !self.due(&skill.name, expression, timezone, minute) {
                    continue;
                }
                debug!(skill = %skill.name, expression = %expression, "Crontab fired");
                let fire = ScheduledFire {
                    skill: skill.name.clone(),
                    event: Event::tick(now),
                };
                if self.fires.send(fire).await.is_err() {
                    warn!("Scheduled fire dropped, runtime receiver is gone");
                    return;
                }
            }
        }
    }

    fn due(
        &self,
        skill: &str,
        expression: &str,
        timezone: Option<&str>,
        minute: DateTime<Utc>,
    ) -> bool {
        let schedule = match normalize_crontab(expression).parse::<cron::Schedule>() {
            Ok(schedule) => schedule,
            Err(e) => {
                error!(skill = %skill, expression = %expression, error = %e, "Invalid crontab expression");
                return false;
            }
        };
        let tz = match timezone {
            Some(name) => match resolve_timezone(name) {
                Ok(tz) => tz,
                Err(e) => {
                    error!(skill = %skill, error = %e, "Invalid matcher timezone, using default");
                    self.timezone
                }
            },
            None => self.timezone,
        };
        schedule.includes(minute.with_timezone(&tz))
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(timezone = %self.timezone, "Cron scheduler started");
        loop {
            let wait = until_next_minute(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.run_tick(Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("Cron scheduler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use courier_core::EventKind;
    use courier_skills::Skill;

    fn registry_with(matcher: Matcher) -> Arc<RwLock<SkillRegistry>> {
        let mut registry = SkillRegistry::default();
        registry
            .register(Skill::builder("tick").matcher(matcher).build())
            .unwrap();
        Arc::new(RwLock::new(registry))
    }

    fn service(
        matcher: Matcher,
        timezone: Tz,
    ) -> (CronService, mpsc::Receiver<ScheduledFire>) {
        let (tx, rx) = mpsc::channel(8);
        (CronService::new(registry_with(matcher), timezone, tx), rx)
    }

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(normalize_crontab("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_crontab("  30 14 * * 1  "), "0 30 14 * * 1");
    }

    #[test]
    fn six_field_expressions_pass_through() {
        assert_eq!(normalize_crontab("0 0 9 * * *"), "0 0 9 * * *");
    }

    #[test]
    fn timezone_names_resolve() {
        assert_eq!(resolve_timezone("Europe/London").unwrap(), Tz::Europe__London);
        assert_eq!(resolve_timezone("UTC").unwrap(), Tz::UTC);
        assert_eq!(resolve_timezone("").unwrap(), Tz::UTC);
        assert!(resolve_timezone("Atlantis/Capital").is_err());
    }

    #[tokio::test]
    async fn fires_once_per_matching_minute() {
        let (service, mut rx) =
            service(Matcher::crontab_in("* * * * *", "Europe/London"), Tz::UTC);
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 30).unwrap();

        service.run_tick(base).await;
        let fire = rx.try_recv().unwrap();
        assert_eq!(fire.skill, "tick");
        assert_eq!(fire.event.kind(), EventKind::Tick);
        assert_eq!(fire.event.connector, "cron");

        // Same minute again: nothing.
        service.run_tick(base + chrono::Duration::seconds(20)).await;
        assert!(rx.try_recv().is_err());

        // The boundary is crossed: exactly one more.
        service.run_tick(base + chrono::Duration::seconds(40)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn matcher_timezone_decides_the_local_hour() {
        // 08:00 UTC is 09:00 in London during summer time.
        let (service, mut rx) =
            service(Matcher::crontab_in("0 9 * * *", "Europe/London"), Tz::UTC);

        service
            .run_tick(Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap())
            .await;
        assert!(rx.try_recv().is_ok());

        service
            .run_tick(Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap())
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn default_timezone_applies_when_the_matcher_has_none() {
        let (service, mut rx) =
            service(Matcher::crontab("30 14 * * *"), Tz::Europe__London);

        // 13:30 UTC is 14:30 London summer time.
        service
            .run_tick(Utc.with_ymd_and_hms(2024, 6, 3, 13, 30, 0).unwrap())
            .await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn an_invalid_expression_never_fires() {
        let (service, mut rx) = service(Matcher::crontab("not a schedule"), Tz::UTC);
        service
            .run_tick(Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap())
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn an_invalid_matcher_timezone_falls_back_to_the_default() {
        let (service, mut rx) =
            service(Matcher::crontab_in("* * * * *", "Atlantis/Capital"), Tz::UTC);
        service
            .run_tick(Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap())
            .await;
        assert!(rx.try_recv().is_ok());
    }
}
