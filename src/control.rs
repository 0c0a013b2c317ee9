use crate::error::{AggregateError, SupervisorError};
use crate::log_buffer::LogBuffer;
use crate::parse::ConfigSource;
use crate::runtime::{spawn_process, ProcessRecord, ServiceStatus};
use crate::subscribers::{LogSink, SubscriberId, SubscriberSet};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};


/// Which services an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Service(String),
}

impl Target {
    /// `"all"` and the empty string select every registered service.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "all" => Target::All,
            name => Target::Service(name.to_string()),
        }
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Target::parse(s)
    }
}

#[derive(Debug, Clone)]
struct ServiceDefinition {
    executable: String,
    environment: Vec<String>,
}

// Everything behind the supervisor lock.
#[derive(Default)]
struct Registry {
    spawn_timeout: Option<Duration>,
    definitions: HashMap<String, ServiceDefinition>,
    processes: HashMap<String, ProcessRecord>,
    logs: HashMap<String, LogBuffer>,
    subscribers: HashMap<String, SubscriberSet>,
    next_record_id: u64,
    next_subscriber_id: u64,
}

impl Registry {
    fn check_timeout(&self) -> Result<Duration, SupervisorError> {
        self.spawn_timeout.ok_or(SupervisorError::TimeoutNotSet)
    }

    fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Per-service outcomes of a bulk start or stop, in attempt order.
#[derive(Debug, Default)]
pub struct BulkReport {
    outcomes: Vec<(String, Result<(), SupervisorError>)>,
}

impl BulkReport {
    pub fn outcomes(&self) -> &[(String, Result<(), SupervisorError>)] {
        &self.outcomes
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, res)| res.is_ok())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, res)| res.is_err())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Fold into a single error listing every failed service. Successful
    /// outcomes are dropped; `Ok(())` means nothing failed.
    pub fn into_result(self) -> Result<(), AggregateError> {
        let mut agg = AggregateError::default();
        for (name, res) in self.outcomes {
            if let Err(e) = res {
                agg.push(name, e);
            }
        }
        if agg.is_empty() {
            Ok(())
        } else {
            Err(agg)
        }
    }
}

/*
    @@@
    @Supervisor;
    . Owns the service definitions, process records, log buffers and subscribers behind one lock.
    . Cheap to clone: reader tasks and termination watchers each hold a clone.
    . Every public operation takes the lock itself; nothing here assumes the caller holds it.
*/
#[derive(Clone)]
pub struct Supervisor {
    state: Arc<Mutex<Registry>>,
    config: Arc<dyn ConfigSource>,
}

impl Supervisor {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self {
            state: Arc::new(Mutex::new(Registry::default())),
            config,
        }
    }

    /// Insert or replace a service definition. A running process is left alone,
    /// but the service's subscriber list starts over empty.
    pub async fn register_service(&self, name: &str, executable: &str, env: Vec<String>) {
        let mut reg = self.state.lock().await;
        info!(service = name, exec_location = executable, environment_vars = %env.join(", "), "Registered new service");
        reg.definitions.insert(
            name.to_string(),
            ServiceDefinition {
                executable: executable.to_string(),
                environment: env,
            },
        );
        reg.subscribers.insert(name.to_string(), SubscriberSet::new());
    }

    pub async fn set_spawn_timeout(&self, timeout: Duration) {
        let mut reg = self.state.lock().await;
        debug!(timeout_ms = timeout.as_millis() as u64, "Spawn timeout set");
        reg.spawn_timeout = Some(timeout);
    }

    pub async fn spawn_timeout(&self) -> Option<Duration> {
        self.state.lock().await.spawn_timeout
    }

    /// Registered service names, sorted.
    pub async fn services(&self) -> Vec<String> {
        self.state.lock().await.sorted_names()
    }

    /// Never fails: unknown or stopped services report `running: false`.
    pub async fn get_status(&self, target: &Target) -> BTreeMap<String, ServiceStatus> {
        let reg = self.state.lock().await;
        let project = |name: &str| {
            reg.processes
                .get(name)
                .map(ProcessRecord::status)
                .unwrap_or_else(ServiceStatus::stopped)
        };

        match target {
            Target::All => reg
                .definitions
                .keys()
                .map(|name| (name.clone(), project(name)))
                .collect(),
            Target::Service(name) => BTreeMap::from([(name.clone(), project(name))]),
        }
    }

    pub async fn start(&self, target: &Target, env: Vec<String>) -> Result<(), SupervisorError> {
        match target {
            Target::Service(name) => self.start_service(name, env).await,
            Target::All => Ok(self.start_all(env).await.into_result()?),
        }
    }

    /// Start one service and block for the spawn grace period.
    pub async fn start_service(&self, name: &str, env: Vec<String>) -> Result<(), SupervisorError> {
        let mut reg = self.state.lock().await;
        self.start_locked(&mut reg, name, env).await
    }

    /// Attempt every registered service once, one grace period after another.
    pub async fn start_all(&self, env: Vec<String>) -> BulkReport {
        let mut reg = self.state.lock().await;
        let mut report = BulkReport::default();
        for name in reg.sorted_names() {
            let res = self.start_locked(&mut reg, &name, env.clone()).await;
            report.outcomes.push((name, res));
        }
        if !report.failed().is_empty() {
            warn!(failed = ?report.failed(), "Error starting one or more services");
        }
        report
    }

    /// Stop one service, or every service for `Target::All`.
    ///
    /// The bulk error only lists failures: services that were killed do not
    /// appear in it, so a sweep where everything was running returns `Ok(())`.
    /// Use [`Supervisor::stop_all`] for one outcome per service.
    pub async fn stop(&self, target: &Target) -> Result<(), SupervisorError> {
        match target {
            Target::Service(name) => self.stop_service(name).await,
            Target::All => Ok(self.stop_all().await.into_result()?),
        }
    }

    /// Send SIGKILL; the exit itself is observed by the termination watcher.
    pub async fn stop_service(&self, name: &str) -> Result<(), SupervisorError> {
        let mut reg = self.state.lock().await;
        Self::stop_locked(&mut reg, name).await
    }

    /// Attempt to stop every registered service. Services that are not running
    /// are reported as failures like any other. The report holds one outcome per
    /// service, kills included; [`BulkReport::into_result`] keeps only the failures.
    pub async fn stop_all(&self) -> BulkReport {
        let mut reg = self.state.lock().await;
        let mut report = BulkReport::default();
        for name in reg.sorted_names() {
            let res = Self::stop_locked(&mut reg, &name).await;
            report.outcomes.push((name, res));
        }
        if !report.failed().is_empty() {
            warn!(failed = ?report.failed(), "Error stopping one or more services");
        }
        report
    }

    /// Stop-all sweep run when the supervisor itself is going away. The outcome
    /// is logged here, so callers only need to flush their log writer afterwards.
    pub async fn shutdown(&self) -> BulkReport {
        let report = self.stop_all().await;
        info!(
            stopped = ?report.succeeded(),
            not_stopped = ?report.failed(),
            "stopped services on shutdown"
        );
        report
    }

    /// Buffer `line` for `name` and push it to the service's subscribers.
    pub async fn append_to_log(&self, name: &str, line: impl Into<String>) -> Result<(), SupervisorError> {
        let line = line.into();
        let mut reg = self.state.lock().await;
        if !reg.logs.contains_key(name) {
            let buffer = LogBuffer::new(self.config.max_log_lines())?;
            reg.logs.insert(name.to_string(), buffer);
        }
        if let Some(buffer) = reg.logs.get_mut(name) {
            buffer.append(line.clone());
        }
        if let Some(subs) = reg.subscribers.get(name) {
            subs.publish(name, &line);
        }
        Ok(())
    }

    /// Buffered lines of `name`, oldest first.
    pub async fn log_snapshot(&self, name: &str) -> Vec<String> {
        let reg = self.state.lock().await;
        reg.logs.get(name).map(LogBuffer::snapshot).unwrap_or_default()
    }

    /// Attach a sink to the live log of `name`. It only sees lines appended from now on.
    pub async fn add_log_subscriber(&self, name: &str, sink: Arc<dyn LogSink>) -> SubscriberId {
        let mut reg = self.state.lock().await;
        reg.next_subscriber_id += 1;
        let id = SubscriberId(reg.next_subscriber_id);
        reg.subscribers.entry(name.to_string()).or_default().add(id, sink);
        debug!(service = name, subscriber = %id, "Added log subscriber");
        id
    }

    /// In-process subscriber backed by an unbounded channel.
    pub async fn subscribe(&self, name: &str) -> (SubscriberId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_log_subscriber(name, Arc::new(tx)).await;
        (id, rx)
    }

    pub async fn remove_log_subscriber(&self, name: &str, id: SubscriberId) -> bool {
        let mut reg = self.state.lock().await;
        reg.subscribers
            .get_mut(name)
            .map(|subs| subs.remove(id))
            .unwrap_or(false)
    }

    // Called by the termination watcher of record `id` once its process is gone.
    pub(crate) async fn clear_process(&self, name: &str, id: u64) {
        let mut reg = self.state.lock().await;
        if reg.processes.get(name).is_some_and(|rec| rec.id == id) {
            reg.processes.remove(name);
        }
    }



    /*
        @@@
        @start_locked();
        . Refuses unknown services and services that are still live.
        . Falls back to the configured default environment when `env` is empty,
          then appends the service's own entries.
        . Installs the record only once the spawn survived its grace period.
    */
    async fn start_locked(
        &self,
        reg: &mut Registry,
        name: &str,
        env: Vec<String>,
    ) -> Result<(), SupervisorError> {
        let definition = reg
            .definitions
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownService { name: name.to_string() })?;

        if reg.processes.get(name).is_some_and(ProcessRecord::is_live) {
            return Err(SupervisorError::AlreadyRunning { name: name.to_string() });
        }

        let mut env = if env.is_empty() {
            self.config.default_environment()
        } else {
            env
        };
        env.extend(definition.environment.iter().cloned());

        let grace = reg.check_timeout()?;

        reg.next_record_id += 1;
        let id = reg.next_record_id;
        let record = spawn_process(self, id, name, &definition.executable, &env, grace).await?;

        info!(service = name, pid = record.pid(), exec_location = %definition.executable, environment_vars = %env.join(", "), "Started service");
        reg.processes.insert(name.to_string(), record);
        Ok(())
    }

    async fn stop_locked(reg: &mut Registry, name: &str) -> Result<(), SupervisorError> {
        if !reg.definitions.contains_key(name) {
            return Err(SupervisorError::UnknownService { name: name.to_string() });
        }

        let record = match reg.processes.get_mut(name) {
            Some(rec) if rec.is_live() => rec,
            _ => return Err(SupervisorError::NotRunning { name: name.to_string() }),
        };

        let pid = record.pid();
        record.kill(name).await.map_err(|e| {
            warn!(service = name, pid, error = %e, "Couldn't kill service");
            e
        })?;
        info!(service = name, pid, "Sent SIGKILL");
        Ok(())
    }
}
