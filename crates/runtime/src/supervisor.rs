//! Process lifecycle: load a config into a running instance, dispatch until
//! a signal lands, drain, and reload in place on SIGHUP or source changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::Watcher;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_connectors::{build_connector, ConnectorManager, InboundQueue};
use courier_core::config::{DatabaseEntry, SkillEntry};
use courier_core::{Config, Error, Event, Paths, Result};
use courier_parsers::build_parser;
use courier_scheduler::{resolve_timezone, CronService, ScheduledFire};
use courier_skills::{load_script_skill, OutboundPort, Skill, SkillRegistry};
use courier_storage::{Database, InMemoryDatabase, Memory, SqliteDatabase};

use crate::dispatcher::{Dispatcher, ParserSlot};
use crate::metrics::Metrics;
use crate::runner::{ConnectorOutbound, SkillRunner};
use crate::web::{self, WebState};

/// How long draining waits for queued events and running skills.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(300);

/// Lifecycle states, logged as the supervisor moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Loading,
    Running,
    Draining,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Stopped => "stopped",
            RunState::Loading => "loading",
            RunState::Running => "running",
            RunState::Draining => "draining",
        }
    }
}

/// Builds [`Skill`]s from config entries. The binary supplies the catalog
/// of built-in modules; scripted skills load the same way everywhere.
pub trait SkillSource: Send + Sync {
    fn build(&self, entry: &SkillEntry) -> Result<Skill>;
}

/// Loads scripted skills only; `module` entries are unknown here.
pub struct ScriptOnlySource;

impl SkillSource for ScriptOnlySource {
    fn build(&self, entry: &SkillEntry) -> Result<Skill> {
        match (&entry.path, &entry.module) {
            (Some(path), _) => load_script_skill(&entry.name, path, entry.config.clone()),
            (None, Some(module)) => {
                Err(Error::Config(format!("Unknown skill module: {}", module)))
            }
            (None, None) => Err(Error::Config(format!(
                "Skill {} has neither a path nor a module",
                entry.name
            ))),
        }
    }
}

/// Register every configured skill. A skill the source cannot build or
/// whose config fails its schema aborts the load.
pub fn build_registry(config: &Config, source: &dyn SkillSource) -> Result<SkillRegistry> {
    let mut registry = SkillRegistry::default();
    for entry in &config.skills {
        let skill = source.build(entry)?;
        let name = registry.register(skill)?;
        debug!(skill = %name, "Skill registered");
    }
    if registry.all().is_empty() {
        return Err(Error::Config("No skills registered".to_string()));
    }
    Ok(registry)
}

fn build_backend(entry: &DatabaseEntry, paths: &Paths) -> Result<Arc<dyn Database>> {
    match entry.implementation() {
        "memory" => Ok(Arc::new(InMemoryDatabase::new(&entry.name))),
        "sqlite" => {
            let path = entry
                .extra
                .get("file")
                .and_then(|v| v.as_str())
                .map(PathBuf::from)
                .unwrap_or_else(|| paths.sqlite_file());
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(SqliteDatabase::open(&entry.name, &path)?))
        }
        other => Err(Error::Config(format!("Unknown database type: {}", other))),
    }
}

fn watch_sources(config: &Config, tx: mpsc::UnboundedSender<()>) -> Result<notify::RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(
        move |result: std::result::Result<notify::Event, notify::Error>| match result {
            Ok(event)
                if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() =>
            {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Watch error"),
        },
    )
    .map_err(|e| Error::Config(format!("Cannot create source watcher: {}", e)))?;
    let mut watched = 0usize;
    for entry in &config.skills {
        let path = match &entry.path {
            Some(path) => path,
            None => continue,
        };
        match watcher.watch(path, notify::RecursiveMode::NonRecursive) {
            Ok(()) => watched += 1,
            Err(e) => {
                warn!(skill = %entry.name, path = %path.display(), error = %e, "Cannot watch skill source")
            }
        }
    }
    info!(paths = watched, "Autoreload watching skill sources");
    Ok(watcher)
}

/// One unix signal stream; pending forever where unavailable.
struct UnixSignal {
    #[cfg(unix)]
    inner: Option<tokio::signal::unix::Signal>,
}

impl UnixSignal {
    #[cfg(unix)]
    fn install(kind: tokio::signal::unix::SignalKind) -> Self {
        let inner = match tokio::signal::unix::signal(kind) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "Cannot install signal handler");
                None
            }
        };
        Self { inner }
    }

    fn terminate() -> Self {
        #[cfg(unix)]
        {
            Self::install(tokio::signal::unix::SignalKind::terminate())
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    fn hangup() -> Self {
        #[cfg(unix)]
        {
            Self::install(tokio::signal::unix::SignalKind::hangup())
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(signal) = self.inner.as_mut() {
            signal.recv().await;
            return;
        }
        std::future::pending::<()>().await
    }
}

enum ServeOutcome {
    Shutdown,
    Reload,
}

enum Step {
    Shutdown(&'static str),
    Reload(&'static str),
    SourcesChanged,
    Inbound(Option<Event>),
    Fire(Option<ScheduledFire>),
    Idle,
}

/// Everything one loaded config runs: connectors, parsers, storage, cron,
/// web and the dispatch loop state.
struct Instance {
    registry: Arc<RwLock<SkillRegistry>>,
    manager: Arc<ConnectorManager>,
    queue: Arc<InboundQueue>,
    memory: Arc<Memory>,
    outbound: Arc<dyn OutboundPort>,
    runner: Arc<SkillRunner>,
    dispatcher: Arc<Dispatcher>,
    fires: mpsc::Receiver<ScheduledFire>,
    reload_rx: mpsc::UnboundedReceiver<()>,
    _reload_tx: mpsc::UnboundedSender<()>,
    _watcher: Option<notify::RecommendedWatcher>,
    shutdown: broadcast::Sender<()>,
    services: Vec<(String, JoinHandle<()>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl Instance {
    async fn load(config: &Config, paths: &Paths, source: &dyn SkillSource) -> Result<Instance> {
        info!(state = RunState::Loading.as_str(), "Loading configuration");
        let timezone = resolve_timezone(&config.timezone)?;
        let registry = Arc::new(RwLock::new(build_registry(config, source)?));

        let mut connectors = Vec::with_capacity(config.connectors.len());
        for entry in &config.connectors {
            connectors.push(build_connector(entry)?);
        }
        let manager = Arc::new(ConnectorManager::new(connectors)?);
        let queue = manager.queue();

        let mut parsers = Vec::new();
        for entry in &config.parsers {
            if !entry.enabled {
                debug!(parser = %entry.name, "Parser disabled, skipping");
                continue;
            }
            parsers.push(ParserSlot { entry: entry.clone(), parser: build_parser(entry)? });
        }

        let mut backends: Vec<Arc<dyn Database>> = Vec::new();
        for entry in &config.databases {
            match build_backend(entry, paths) {
                Ok(backend) => match backend.connect().await {
                    Ok(()) => backends.push(backend),
                    Err(e) => {
                        error!(database = %entry.name, error = %e, "Backend failed to connect, skipping")
                    }
                },
                Err(e) => {
                    error!(database = %entry.name, error = %e, "Backend failed to build, skipping")
                }
            }
        }
        if backends.is_empty() {
            warn!("No storage backend available, memory reads will find nothing");
        }
        let memory = Arc::new(Memory::new(backends));

        let skill_names: Vec<String> = {
            let registry = registry.read().await;
            registry.all().iter().map(|s| s.name.clone()).collect()
        };
        let metrics = Arc::new(Metrics::new(skill_names));
        let outbound: Arc<dyn OutboundPort> =
            Arc::new(ConnectorOutbound::new(Arc::clone(&manager)));
        let runner = Arc::new(SkillRunner::new(
            Arc::clone(&outbound),
            Arc::clone(&memory),
            Arc::clone(&metrics),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            parsers,
            Arc::clone(&metrics),
        ));

        let (shutdown, _) = broadcast::channel::<()>(1);
        let mut services: Vec<(String, JoinHandle<()>)> = Vec::new();

        // Connectors come up before anything can fire a skill.
        let listeners = manager.start(&shutdown).await?;
        for (i, handle) in listeners.into_iter().enumerate() {
            services.push((format!("listener-{}", i), handle));
        }

        let (fires_tx, fires) = mpsc::channel::<ScheduledFire>(16);
        let cron = Arc::new(CronService::new(Arc::clone(&registry), timezone, fires_tx));
        services.push((
            "cron".to_string(),
            tokio::spawn(cron.run_loop(shutdown.subscribe())),
        ));

        if config.web.ssl.is_some() {
            warn!("TLS termination is left to the fronting proxy, serving plain HTTP");
        }
        let bind = format!("{}:{}", config.web.host, config.web.bind_port());
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = shutdown.send(());
                manager.stop().await;
                return Err(Error::Transport(format!(
                    "Cannot bind web listener on {}: {}",
                    bind, e
                )));
            }
        };
        info!(address = %bind, "Web interface listening");
        let web_state = WebState {
            registry: Arc::clone(&registry),
            runner: Arc::clone(&runner),
            metrics: Arc::clone(&metrics),
            token: config.web.webhook_token.clone(),
            default_connector: manager.default_connector().to_string(),
            hide_index: config.web.disable_web_index_handler_in_root,
        };
        services.push((
            "web".to_string(),
            web::spawn_server(listener, web_state, shutdown.subscribe()),
        ));

        let (reload_tx, reload_rx) = mpsc::unbounded_channel::<()>();
        let watcher = if config.autoreload {
            match watch_sources(config, reload_tx.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(error = %e, "Autoreload watcher failed to start");
                    None
                }
            }
        } else {
            None
        };

        {
            let registry = registry.read().await;
            registry.run_setup(&outbound, &memory).await;
        }

        Ok(Instance {
            registry,
            manager,
            queue,
            memory,
            outbound,
            runner,
            dispatcher,
            fires,
            reload_rx,
            _reload_tx: reload_tx,
            _watcher: watcher,
            shutdown,
            services,
            tasks: Vec::new(),
        })
    }

    /// Dispatch until a signal or reload request arrives.
    async fn serve(&mut self, welcome: bool) -> ServeOutcome {
        info!(
            state = RunState::Running.as_str(),
            connectors = ?self.manager.names(),
            "Runtime up"
        );
        if welcome {
            info!(
                version = env!("CARGO_PKG_VERSION"),
                "Courier is running, press ctrl+c to stop"
            );
        }

        // Lifecycle announcement for always-skills.
        let started = Event::started(self.manager.default_connector());
        self.process(started).await;

        let mut terminate = UnixSignal::terminate();
        let mut hangup = UnixSignal::hangup();
        let mut cron_alive = true;

        loop {
            let step = tokio::select! {
                _ = tokio::signal::ctrl_c() => Step::Shutdown("interrupt"),
                _ = terminate.recv() => Step::Shutdown("terminate"),
                _ = hangup.recv() => Step::Reload("hangup"),
                changed = self.reload_rx.recv() => match changed {
                    Some(()) => Step::SourcesChanged,
                    None => Step::Idle,
                },
                event = self.queue.pop() => Step::Inbound(event),
                fire = self.fires.recv(), if cron_alive => Step::Fire(fire),
            };
            match step {
                Step::Shutdown(signal) => {
                    info!(signal, "Shutdown requested");
                    return ServeOutcome::Shutdown;
                }
                Step::Reload(signal) => {
                    info!(signal, "Reload requested");
                    return ServeOutcome::Reload;
                }
                Step::SourcesChanged => {
                    tokio::time::sleep(RELOAD_DEBOUNCE).await;
                    while self.reload_rx.try_recv().is_ok() {}
                    info!("Skill sources changed, reloading");
                    return ServeOutcome::Reload;
                }
                Step::Inbound(Some(event)) => self.process(event).await,
                Step::Inbound(None) => {
                    warn!("Inbound queue closed, draining");
                    return ServeOutcome::Shutdown;
                }
                Step::Fire(Some(fire)) => self.run_fire(fire).await,
                Step::Fire(None) => {
                    warn!("Cron channel closed");
                    cron_alive = false;
                }
                Step::Idle => {}
            }
        }
    }

    /// Always-skills start first and run alongside the ranked selection;
    /// the top ranked candidate is the only other skill that runs.
    async fn process(&mut self, event: Event) {
        debug!(kind = %event.kind(), connector = %event.connector, "Dispatching event");
        for candidate in self.dispatcher.always_candidates(&event).await {
            let handle = self.runner.spawn(candidate.skill, candidate.event);
            self.track(handle);
        }
        let ranked = self.dispatcher.rank(&event).await;
        match ranked.into_iter().next() {
            Some(winner) => {
                debug!(skill = %winner.skill.name, score = winner.score, kind = ?winner.kind, "Skill selected");
                let handle = self.runner.spawn(winner.skill, winner.event);
                self.track(handle);
            }
            None => debug!("No skill matched"),
        }
    }

    /// Crontab fires name their skill directly and bypass ranking.
    async fn run_fire(&mut self, fire: ScheduledFire) {
        let skill = {
            let registry = self.registry.read().await;
            registry.by_name(&fire.skill)
        };
        match skill {
            Some(skill) => {
                debug!(skill = %skill.name, "Scheduled fire");
                let handle = self.runner.spawn(skill, fire.event);
                self.track(handle);
            }
            None => warn!(skill = %fire.skill, "Scheduled fire for unknown skill, dropped"),
        }
    }

    fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(handle);
    }

    /// Stop intake, run down what is queued and in flight within the drain
    /// deadline, then abort the rest.
    async fn shutdown_and_drain(mut self) {
        info!(state = RunState::Draining.as_str(), "Draining");
        let _ = self.shutdown.send(());
        self.queue.close().await;
        let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.queue.pop()).await {
                Ok(Some(event)) => self.process(event).await,
                Ok(None) | Err(_) => break,
            }
        }
        let discarded = self.queue.clear().await;
        if discarded > 0 {
            warn!(count = discarded, "Discarded inbound events past the drain deadline");
        }

        // Teardown hooks run while the outbound path still works.
        {
            let registry = self.registry.read().await;
            registry.run_teardown(&self.outbound, &self.memory).await;
        }

        let mut waiting: Vec<(String, JoinHandle<()>)> = Vec::new();
        for (i, task) in self.tasks.into_iter().enumerate() {
            waiting.push((format!("skill-{}", i), task));
        }
        waiting.extend(self.services);

        let total = waiting.len();
        let mut aborted = 0usize;
        while tokio::time::Instant::now() < deadline {
            if waiting.iter().all(|(_, task)| task.is_finished()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for (name, task) in &waiting {
            if !task.is_finished() {
                warn!(task = %name, "Task did not exit in the drain window, aborting");
                task.abort();
                aborted += 1;
            }
        }
        for (name, task) in waiting {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => debug!(task = %name, "Task aborted"),
                Err(_) => error!(task = %name, "Task panicked during shutdown"),
            }
        }
        self.manager.stop().await;
        info!(state = RunState::Stopped.as_str(), total, aborted, "Drained");
    }
}

/// Owns the config path and restarts instances across reloads.
pub struct Supervisor {
    config_path: PathBuf,
    paths: Paths,
    source: Arc<dyn SkillSource>,
}

impl Supervisor {
    pub fn new(config_path: PathBuf, paths: Paths, source: Arc<dyn SkillSource>) -> Self {
        Self { config_path, paths, source }
    }

    /// Run until a shutdown signal lands. A reload drains the current
    /// instance and starts a fresh one; when the new config is broken the
    /// previous one is restored.
    pub async fn run(&self) -> Result<()> {
        let mut config = Config::load(&self.config_path)?;
        let mut instance = Instance::load(&config, &self.paths, self.source.as_ref()).await?;
        loop {
            let outcome = instance.serve(config.welcome_message).await;
            instance.shutdown_and_drain().await;
            match outcome {
                ServeOutcome::Shutdown => break,
                ServeOutcome::Reload => {
                    instance = self.reload(&mut config).await?;
                }
            }
        }
        info!("Courier stopped");
        Ok(())
    }

    async fn reload(&self, config: &mut Config) -> Result<Instance> {
        match Config::load(&self.config_path) {
            Ok(next) => match Instance::load(&next, &self.paths, self.source.as_ref()).await {
                Ok(instance) => {
                    *config = next;
                    info!("Reload complete");
                    Ok(instance)
                }
                Err(e) => {
                    error!(error = %e, "Reload failed, restoring previous configuration");
                    Instance::load(config, &self.paths, self.source.as_ref()).await
                }
            },
            Err(e) => {
                error!(error = %e, "Cannot re-read configuration, restoring previous");
                Instance::load(config, &self.paths, self.source.as_ref()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use courier_core::config::ConnectorEntry;
    use courier_core::Matcher;
    use courier_skills::{FieldKind, FieldSpec};

    struct FixedSource;

    impl SkillSource for FixedSource {
        fn build(&self, entry: &SkillEntry) -> Result<Skill> {
            Ok(Skill::builder(&entry.name)
                .matcher(Matcher::regex("ping"))
                .config(entry.config.clone())
                .build())
        }
    }

    struct StrictSource;

    impl SkillSource for StrictSource {
        fn build(&self, entry: &SkillEntry) -> Result<Skill> {
            Ok(Skill::builder(&entry.name)
                .schema(vec![FieldSpec::required("url", FieldKind::String)])
                .config(entry.config.clone())
                .matcher(Matcher::regex("ping"))
                .build())
        }
    }

    fn config_with_skills(skills: Vec<SkillEntry>) -> Config {
        Config {
            connectors: vec![ConnectorEntry::named("shell")],
            skills,
            ..Config::default()
        }
    }

    #[test]
    fn rebuilding_from_the_same_config_yields_the_same_registry() {
        let config = config_with_skills(vec![
            SkillEntry::module("hello", "hello"),
            SkillEntry::module("ping", "ping"),
        ]);
        let first = build_registry(&config, &FixedSource).unwrap();
        let second = build_registry(&config, &FixedSource).unwrap();

        let names = |registry: &SkillRegistry| {
            registry.all().iter().map(|s| s.name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
        let kinds = |registry: &SkillRegistry| {
            registry
                .all()
                .iter()
                .map(|s| s.matchers.iter().map(|m| m.kind()).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        };
        assert_eq!(kinds(&first), kinds(&second));
    }

    #[test]
    fn schema_violations_abort_the_load() {
        let mut entry = SkillEntry::module("fetch", "fetch");
        entry.config = json!({"retries": 3});
        let config = config_with_skills(vec![entry]);
        assert!(build_registry(&config, &StrictSource).is_err());
    }

    #[test]
    fn an_empty_skill_list_does_not_load() {
        let config = config_with_skills(Vec::new());
        assert!(build_registry(&config, &FixedSource).is_err());
    }

    #[test]
    fn script_only_source_rejects_module_entries() {
        let entry = SkillEntry::module("hello", "hello");
        assert!(ScriptOnlySource.build(&entry).is_err());
    }

    #[test]
    fn memory_backend_builds_by_name() {
        let entry = DatabaseEntry::named("memory");
        let paths = Paths::with_base(std::env::temp_dir().join("courier-test"));
        assert!(build_backend(&entry, &paths).is_ok());
    }

    #[test]
    fn unknown_backend_type_is_rejected() {
        let entry = DatabaseEntry::named("etcd");
        let paths = Paths::with_base(std::env::temp_dir().join("courier-test"));
        assert!(build_backend(&entry, &paths).is_err());
    }

    #[test]
    fn sqlite_backend_opens_a_file_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = DatabaseEntry::named("sqlite");
        entry.extra.insert(
            "file".to_string(),
            json!(dir.path().join("state.db").to_string_lossy()),
        );
        let paths = Paths::with_base(dir.path().to_path_buf());
        assert!(build_backend(&entry, &paths).is_ok());
    }

    #[test]
    fn run_states_log_in_lowercase() {
        assert_eq!(RunState::Loading.as_str(), "loading");
        assert_eq!(RunState::Stopped.as_str(), "stopped");
    }
}
