//! Plan model: the merged, validated configuration of services and checks.
//!
//! The plan is produced outside the orchestration core (layers are combined
//! before they reach us). This module only defines its shape, defaults,
//! validation, and the per-service fingerprint used by replan.

use crate::daemon::deps::{self, Direction};
use crate::error::PlanError;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_BACKOFF_LIMIT: Duration = Duration::from_secs(30);
pub const DEFAULT_KILL_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_CHECK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    #[serde(default)]
    pub services: NamedMap<Service>,
    #[serde(default)]
    pub checks: NamedMap<Check>,
}

impl Plan {
    /// Read and validate a plan file.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let plan: Plan = toml::from_str(&content).map_err(|source| PlanError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        plan.validate()?;
        tracing::debug!(
            path = %path.display(),
            services = plan.services.len(),
            checks = plan.checks.len(),
            "Plan loaded"
        );
        Ok(plan)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn check(&self, name: &str) -> Option<&Check> {
        self.checks.get(name)
    }

    /// Names of services with `startup = "enabled"`, in declaration order.
    pub fn enabled_services(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|s| s.startup == Startup::Enabled)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Combine a layer on top of this plan. Entries in the layer replace
    /// entries of the same name; new entries are appended. The result is
    /// validated as a whole.
    pub fn combine(&self, layer: Plan) -> Result<Plan, PlanError> {
        let mut combined = self.clone();
        for service in layer.services.into_iter() {
            combined.services.insert(service);
        }
        for check in layer.checks.into_iter() {
            combined.checks.insert(check);
        }
        combined.validate()?;
        Ok(combined)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        for service in self.services.iter() {
            service.validate(self)?;
        }
        for check in self.checks.iter() {
            check.validate(self)?;
        }
        let names: Vec<String> = self.services.names().map(str::to_string).collect();
        deps::order(self, &names, Direction::Start)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Startup {
    Enabled,
    #[default]
    Disabled,
}

impl Startup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Startup::Enabled => "enabled",
            Startup::Disabled => "disabled",
        }
    }
}

/// What to do when a service exits or one of its checks fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceAction {
    #[default]
    Restart,
    Shutdown,
    FailureShutdown,
    SuccessShutdown,
    Ignore,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Restart => "restart",
            ServiceAction::Shutdown => "shutdown",
            ServiceAction::FailureShutdown => "failure-shutdown",
            ServiceAction::SuccessShutdown => "success-shutdown",
            ServiceAction::Ignore => "ignore",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Service {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub startup: Startup,

    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub user_id: Option<u32>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub group_id: Option<u32>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub on_success: ServiceAction,
    #[serde(default)]
    pub on_failure: ServiceAction,
    #[serde(default)]
    pub on_check_failure: BTreeMap<String, ServiceAction>,
    #[serde(default = "default_backoff_delay", with = "duration_str")]
    pub backoff_delay: Duration,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_limit", with = "duration_str")]
    pub backoff_limit: Duration,
    #[serde(default = "default_kill_delay", with = "duration_str")]
    pub kill_delay: Duration,
}

impl Service {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            summary: String::new(),
            command: command.into(),
            args: Vec::new(),
            startup: Startup::Disabled,
            requires: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            environment: BTreeMap::new(),
            user: None,
            user_id: None,
            group: None,
            group_id: None,
            working_dir: None,
            on_success: ServiceAction::Restart,
            on_failure: ServiceAction::Restart,
            on_check_failure: BTreeMap::new(),
            backoff_delay: DEFAULT_BACKOFF_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            backoff_limit: DEFAULT_BACKOFF_LIMIT,
            kill_delay: DEFAULT_KILL_DELAY,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn startup(mut self, startup: Startup) -> Self {
        self.startup = startup;
        self
    }

    pub fn requires<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = names.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn before<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.before = names.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn after<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after = names.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn on_exit(mut self, on_success: ServiceAction, on_failure: ServiceAction) -> Self {
        self.on_success = on_success;
        self.on_failure = on_failure;
        self
    }

    pub fn on_check_failure(mut self, check: impl Into<String>, action: ServiceAction) -> Self {
        self.on_check_failure.insert(check.into(), action);
        self
    }

    pub fn backoff(mut self, delay: Duration, factor: f64, limit: Duration) -> Self {
        self.backoff_delay = delay;
        self.backoff_factor = factor;
        self.backoff_limit = limit;
        self
    }

    pub fn kill_delay(mut self, delay: Duration) -> Self {
        self.kill_delay = delay;
        self
    }

    /// Action configured for an unplanned exit with the given exit code,
    /// along with the name of the setting it came from.
    pub fn exit_action(&self, exit_code: i32) -> (ServiceAction, &'static str) {
        if exit_code == 0 {
            (self.on_success, "on-success")
        } else {
            (self.on_failure, "on-failure")
        }
    }

    /// Digest of everything that affects how the service runs. Two entries
    /// with the same fingerprint need no restart on replan.
    pub fn fingerprint(&self) -> String {
        // Field order is fixed by the struct and maps are ordered, so the
        // JSON encoding is canonical.
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn validate(&self, plan: &Plan) -> Result<(), PlanError> {
        if self.command.trim().is_empty() {
            return Err(PlanError::MissingField {
                entity: "service",
                name: self.name.clone(),
                field: "command",
            });
        }
        for dep in self
            .requires
            .iter()
            .chain(self.before.iter())
            .chain(self.after.iter())
        {
            if plan.service(dep).is_none() {
                return Err(PlanError::Invalid {
                    entity: "service",
                    name: self.name.clone(),
                    message: format!("dependency {dep:?} does not exist"),
                });
            }
        }
        for check in self.on_check_failure.keys() {
            if plan.check(check).is_none() {
                return Err(PlanError::Invalid {
                    entity: "service",
                    name: self.name.clone(),
                    message: format!("on-check-failure refers to unknown check {check:?}"),
                });
            }
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(PlanError::Invalid {
                entity: "service",
                name: self.name.clone(),
                message: format!("backoff-factor must be 1.0 or greater, not {}", self.backoff_factor),
            });
        }
        if self.backoff_delay.is_zero() || self.backoff_limit < self.backoff_delay {
            return Err(PlanError::Invalid {
                entity: "service",
                name: self.name.clone(),
                message: "backoff-limit must not be less than a non-zero backoff-delay".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckLevel {
    #[default]
    #[serde(rename = "none")]
    Unset,
    Alive,
    Ready,
}

impl CheckLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckLevel::Unset => "none",
            CheckLevel::Alive => "alive",
            CheckLevel::Ready => "ready",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "none" => Some(CheckLevel::Unset),
            "alive" => Some(CheckLevel::Alive),
            "ready" => Some(CheckLevel::Ready),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Check {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub level: CheckLevel,
    #[serde(default = "default_check_startup")]
    pub startup: Startup,
    #[serde(default = "default_check_period", with = "duration_str")]
    pub period: Duration,
    #[serde(default = "default_check_timeout", with = "duration_str")]
    pub timeout: Duration,
    #[serde(default = "default_check_threshold")]
    pub threshold: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecCheck>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HttpCheck {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TcpCheck {
    #[serde(default)]
    pub host: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ExecCheck {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Inherit user, group, working directory and environment from a service.
    #[serde(default)]
    pub service_context: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub user_id: Option<u32>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub group_id: Option<u32>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Check {
    fn base(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            level: CheckLevel::Unset,
            startup: Startup::Enabled,
            period: DEFAULT_CHECK_PERIOD,
            timeout: DEFAULT_CHECK_TIMEOUT,
            threshold: DEFAULT_CHECK_THRESHOLD,
            http: None,
            tcp: None,
            exec: None,
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut check = Self::base(name);
        check.http = Some(HttpCheck {
            url: url.into(),
            headers: BTreeMap::new(),
        });
        check
    }

    pub fn tcp(name: impl Into<String>, host: Option<&str>, port: u16) -> Self {
        let mut check = Self::base(name);
        check.tcp = Some(TcpCheck {
            host: host.map(str::to_string),
            port,
        });
        check
    }

    pub fn exec<I, S>(name: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut check = Self::base(name);
        check.exec = Some(ExecCheck {
            command: command.into(),
            args: args.into_iter().map(|s| s.into()).collect(),
            ..ExecCheck::default()
        });
        check
    }

    pub fn level(mut self, level: CheckLevel) -> Self {
        self.level = level;
        self
    }

    pub fn startup(mut self, startup: Startup) -> Self {
        self.startup = startup;
        self
    }

    pub fn timing(mut self, period: Duration, timeout: Duration, threshold: u32) -> Self {
        self.period = period;
        self.timeout = timeout;
        self.threshold = threshold;
        self
    }

    pub fn kind(&self) -> &'static str {
        if self.http.is_some() {
            "http"
        } else if self.tcp.is_some() {
            "tcp"
        } else {
            "exec"
        }
    }

    fn invalid(&self, message: impl Into<String>) -> PlanError {
        PlanError::Invalid {
            entity: "check",
            name: self.name.clone(),
            message: message.into(),
        }
    }

    fn validate(&self, plan: &Plan) -> Result<(), PlanError> {
        let kinds = [self.http.is_some(), self.tcp.is_some(), self.exec.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        match kinds {
            0 => return Err(self.invalid("must specify one of http, tcp or exec")),
            1 => {}
            _ => return Err(self.invalid("must specify only one of http, tcp or exec")),
        }
        if self.period.is_zero() {
            return Err(self.invalid("period must not be zero"));
        }
        if self.timeout.is_zero() || self.timeout >= self.period {
            return Err(self.invalid("timeout must be non-zero and less than period"));
        }
        if self.threshold == 0 {
            return Err(self.invalid("threshold must be greater than zero"));
        }
        if let Some(http) = &self.http {
            if http.url.is_empty() {
                return Err(PlanError::MissingField {
                    entity: "check",
                    name: self.name.clone(),
                    field: "http.url",
                });
            }
        }
        if let Some(tcp) = &self.tcp {
            if tcp.port == 0 {
                return Err(self.invalid("tcp.port must be set"));
            }
        }
        if let Some(exec) = &self.exec {
            if exec.command.trim().is_empty() {
                return Err(PlanError::MissingField {
                    entity: "check",
                    name: self.name.clone(),
                    field: "exec.command",
                });
            }
            if let Some(service) = &exec.service_context {
                if plan.service(service).is_none() {
                    return Err(self.invalid(format!(
                        "exec.service-context refers to unknown service {service:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// An entry of a [`NamedMap`], keyed by its name.
pub trait Named {
    fn name(&self) -> &str;
    fn set_name(&mut self, name: String);
}

impl Named for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

impl Named for Check {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

/// Name-keyed table that keeps declaration order, so dependency ordering can
/// break ties deterministically.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedMap<T> {
    entries: Vec<T>,
}

impl<T> Default for NamedMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: Named> NamedMap<T> {
    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.iter().find(|e| e.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Declaration index of the named entry.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name() == name)
    }

    /// Replace the entry with the same name in place, or append it.
    pub fn insert(&mut self, entry: T) {
        match self.position(entry.name()) {
            Some(index) => self.entries[index] = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        let index = self.position(name)?;
        Some(self.entries.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> IntoIterator for NamedMap<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<T: Named> FromIterator<T> for NamedMap<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut map = NamedMap::default();
        for entry in iter {
            map.insert(entry);
        }
        map
    }
}

impl<T: Named + Serialize> Serialize for NamedMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(entry.name(), entry)?;
        }
        map.end()
    }
}

impl<'de, T: Named + Deserialize<'de>> Deserialize<'de> for NamedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NamedMapVisitor<T>(PhantomData<T>);

        impl<'de, T: Named + Deserialize<'de>> Visitor<'de> for NamedMapVisitor<T> {
            type Value = NamedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a table of named entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = NamedMap::default();
                while let Some((name, mut entry)) = access.next_entry::<String, T>()? {
                    entry.set_name(name);
                    map.insert(entry);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(NamedMapVisitor(PhantomData))
    }
}

fn default_backoff_delay() -> Duration {
    DEFAULT_BACKOFF_DELAY
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

fn default_backoff_limit() -> Duration {
    DEFAULT_BACKOFF_LIMIT
}

fn default_kill_delay() -> Duration {
    DEFAULT_KILL_DELAY
}

fn default_check_startup() -> Startup {
    Startup::Enabled
}

fn default_check_period() -> Duration {
    DEFAULT_CHECK_PERIOD
}

fn default_check_timeout() -> Duration {
    DEFAULT_CHECK_TIMEOUT
}

fn default_check_threshold() -> u32 {
    DEFAULT_CHECK_THRESHOLD
}

/// Parse durations such as `500ms`, `2s`, `1m30s` or `1.5h`.
pub fn parse_duration(input: &str) -> Result<Duration, PlanError> {
    let invalid = || PlanError::Duration(input.to_string());
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut seconds = 0f64;
    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_end].parse().map_err(|_| invalid())?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        seconds += value * scale;
        rest = &rest[unit_end..];
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}

mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
[services.db]
command = "postgres"
startup = "enabled"

[services.web]
command = "server"
args = ["--port", "8080"]
startup = "enabled"
requires = ["db"]
after = ["db"]
backoff-delay = "1s"
backoff-factor = 1.5
on-check-failure = { "web-up" = "restart" }

[services.aaa]
command = "worker"

[checks.web-up]
level = "alive"
period = "5s"
timeout = "1s"
threshold = 2
http = { url = "http://localhost:8080/health" }
"#;

    #[test]
    fn parse_plan_with_defaults() {
        let plan: Plan = toml::from_str(PLAN).unwrap();
        plan.validate().unwrap();

        let names: Vec<&str> = plan.services.names().collect();
        assert_eq!(names, vec!["db", "web", "aaa"]);

        let web = plan.service("web").unwrap();
        assert_eq!(web.name, "web");
        assert_eq!(web.args, vec!["--port", "8080"]);
        assert_eq!(web.backoff_delay, Duration::from_secs(1));
        assert_eq!(web.backoff_factor, 1.5);
        assert_eq!(web.backoff_limit, DEFAULT_BACKOFF_LIMIT);
        assert_eq!(web.kill_delay, DEFAULT_KILL_DELAY);
        assert_eq!(web.on_failure, ServiceAction::Restart);
        assert_eq!(web.on_check_failure["web-up"], ServiceAction::Restart);

        let check = plan.check("web-up").unwrap();
        assert_eq!(check.level, CheckLevel::Alive);
        assert_eq!(check.threshold, 2);
        assert_eq!(check.startup, Startup::Enabled);
        assert_eq!(check.kind(), "http");

        assert_eq!(plan.enabled_services(), vec!["db", "web"]);
    }

    #[test]
    fn missing_command_is_rejected() {
        let plan: Plan = toml::from_str("[services.x]\nstartup = \"enabled\"\n").unwrap();
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, PlanError::MissingField { field: "command", .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut plan = Plan::default();
        plan.services.insert(Service::new("a", "true").requires(["ghost"]));
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn backoff_factor_below_one_is_rejected() {
        let mut plan = Plan::default();
        plan.services.insert(Service::new("a", "true").backoff(
            Duration::from_millis(500),
            0.5,
            Duration::from_secs(30),
        ));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn check_needs_exactly_one_type() {
        let mut plan = Plan::default();
        let mut check = Check::tcp("c", None, 80);
        check.http = Some(HttpCheck {
            url: "http://x".into(),
            headers: BTreeMap::new(),
        });
        plan.checks.insert(check);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn check_timeout_must_be_below_period() {
        let mut plan = Plan::default();
        plan.checks.insert(Check::tcp("c", None, 80).timing(
            Duration::from_secs(1),
            Duration::from_secs(1),
            3,
        ));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn cycle_is_rejected_on_validate() {
        let mut plan = Plan::default();
        plan.services.insert(Service::new("a", "true").after(["b"]));
        plan.services.insert(Service::new("b", "true").after(["a"]));
        assert!(matches!(plan.validate(), Err(PlanError::Cycle(_))));
    }

    #[test]
    fn combine_replaces_by_name_and_appends() {
        let base: Plan = toml::from_str(PLAN).unwrap();
        let mut layer = Plan::default();
        layer
            .services
            .insert(Service::new("aaa", "other-worker").startup(Startup::Enabled));
        layer.services.insert(Service::new("zzz", "cron"));

        let combined = base.combine(layer).unwrap();
        let names: Vec<&str> = combined.services.names().collect();
        assert_eq!(names, vec!["db", "web", "aaa", "zzz"]);
        assert_eq!(combined.service("aaa").unwrap().command, "other-worker");
    }

    #[test]
    fn fingerprint_tracks_configuration() {
        let a = Service::new("a", "sleep").args(["10"]);
        let same = Service::new("a", "sleep").args(["10"]);
        let changed = Service::new("a", "sleep").args(["20"]);
        assert_eq!(a.fingerprint(), same.fingerprint());
        assert_ne!(a.fingerprint(), changed.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5 parsecs").is_err());
        assert!(matches!(
            parse_duration("99999999999999999999h"),
            Err(PlanError::Duration(_))
        ));

        let overflow = "[services.db]\ncommand = \"db\"\nbackoff-limit = \"99999999999999999999h\"\n";
        assert!(toml::from_str::<Plan>(overflow).is_err());

        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
    }
}
