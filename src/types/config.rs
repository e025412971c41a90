//! Configuration access.
//!
//! Configuration reaches the container as an opaque string-to-string map
//! (the launcher passes it through the `CONFIG` environment variable as one
//! JSON object). [`Config`] wraps that map with typed accessors; the view
//! structs below own all key construction so no other module assembles key
//! strings by hand. Missing required keys fail at setup time naming the
//! exact key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{Error, Result, SystemStream};

/// Immutable string-to-string configuration map.
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: HashMap<String, String>,
}

impl Config {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    /// Parse the `CONFIG` environment payload: one JSON object. String
    /// values are taken as-is; numbers and booleans are stringified so
    /// launchers may write `"task.commit.ms": 0` without quoting.
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::setup("CONFIG must be a JSON object"))?;

        let mut entries = HashMap::with_capacity(object.len());
        for (key, value) in object {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(Error::config(
                        key.clone(),
                        format!("expected scalar value, got {}", type_name(other)),
                    ))
                }
            };
            entries.insert(key.clone(), rendered);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_required(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::config(key, "required key missing"))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(Error::config(
                key,
                format!("expected 'true' or 'false', got '{}'", other),
            )),
        }
    }

    pub fn get_i64(&self, key: &str, default: i64) -> Result<i64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| Error::config(key, format!("expected integer, got '{}'", raw))),
        }
    }

    /// Comma-separated list value; absent or blank yields an empty list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All keys with the given prefix, in sorted order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Where a stream starts when no checkpointed offset applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

// =============================================================================
// Task configuration
// =============================================================================

pub struct TaskConfig<'a>(&'a Config);

impl<'a> TaskConfig<'a> {
    pub const FACTORY: &'static str = "task.factory";
    pub const INPUTS: &'static str = "task.inputs";
    pub const WINDOW_MS: &'static str = "task.window.ms";
    pub const COMMIT_MS: &'static str = "task.commit.ms";
    pub const CHECKPOINT_FACTORY: &'static str = "task.checkpoint.factory";
    pub const CHECKPOINT_PATH: &'static str = "task.checkpoint.path";
    pub const CHOOSER_FACTORY: &'static str = "task.chooser.factory";
    pub const DROP_DESERIALIZATION_ERRORS: &'static str = "task.drop.deserialization.errors";
    pub const LIFECYCLE_LISTENERS: &'static str = "task.lifecycle.listeners";

    pub fn new(config: &'a Config) -> Self {
        Self(config)
    }

    pub fn task_factory(&self) -> Result<&str> {
        self.0.get_required(Self::FACTORY)
    }

    /// The declared input streams. Required and non-empty.
    pub fn inputs(&self) -> Result<Vec<SystemStream>> {
        let raw = self.0.get_required(Self::INPUTS)?;
        let streams: Vec<SystemStream> = raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(SystemStream::parse)
            .collect::<Result<_>>()?;
        if streams.is_empty() {
            return Err(Error::config(Self::INPUTS, "at least one input required"));
        }
        Ok(streams)
    }

    /// Window interval in ms; negative disables windowing.
    pub fn window_ms(&self) -> Result<i64> {
        self.0.get_i64(Self::WINDOW_MS, -1)
    }

    /// Commit interval in ms; zero commits every iteration, negative
    /// disables interval-driven commits (coordinator requests still apply).
    pub fn commit_ms(&self) -> Result<i64> {
        self.0.get_i64(Self::COMMIT_MS, 60_000)
    }

    pub fn checkpoint_factory(&self) -> Option<&str> {
        self.0.get(Self::CHECKPOINT_FACTORY)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        PathBuf::from(self.0.get(Self::CHECKPOINT_PATH).unwrap_or("./checkpoints"))
    }

    pub fn chooser_factory(&self) -> &str {
        self.0.get(Self::CHOOSER_FACTORY).unwrap_or("round-robin")
    }

    pub fn drop_deserialization_errors(&self) -> Result<bool> {
        self.0.get_bool(Self::DROP_DESERIALIZATION_ERRORS, false)
    }

    pub fn lifecycle_listeners(&self) -> Vec<String> {
        self.0.get_list(Self::LIFECYCLE_LISTENERS)
    }

    pub fn listener_factory(&self, name: &str) -> Result<&str> {
        let key = format!("task.lifecycle.listener.{}.factory", name);
        self.0
            .get(&key)
            .ok_or_else(|| Error::config(key, "required key missing"))
    }
}

// =============================================================================
// System configuration
// =============================================================================

pub struct SystemConfig<'a>(&'a Config);

impl<'a> SystemConfig<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self(config)
    }

    pub fn factory_key(system: &str) -> String {
        format!("systems.{}.factory", system)
    }

    pub fn factory(&self, system: &str) -> Result<&str> {
        let key = Self::factory_key(system);
        self.0
            .get(&key)
            .ok_or_else(|| Error::config(key, "required key missing"))
    }

    /// All systems declared in config, sorted.
    pub fn system_names(&self) -> Vec<String> {
        self.0
            .keys_with_prefix("systems.")
            .into_iter()
            .filter_map(|key| {
                let middle = key.strip_prefix("systems.")?.strip_suffix(".factory")?;
                (!middle.contains('.')).then(|| middle.to_string())
            })
            .collect()
    }

    pub fn key_serde(&self, system: &str) -> Option<&str> {
        self.0.get(&format!("systems.{}.key.serde", system))
    }

    pub fn msg_serde(&self, system: &str) -> Option<&str> {
        self.0.get(&format!("systems.{}.msg.serde", system))
    }

    /// Broker scope for the in-memory system; defaults to the system name.
    pub fn inmemory_scope(&self, system: &str) -> String {
        self.0
            .get(&format!("systems.{}.inmemory.scope", system))
            .unwrap_or(system)
            .to_string()
    }
}

// =============================================================================
// Stream configuration
// =============================================================================

pub struct StreamConfig<'a>(&'a Config);

impl<'a> StreamConfig<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self(config)
    }

    pub fn key_serde(&self, ss: &SystemStream) -> Option<&str> {
        self.0
            .get(&format!("streams.{}.{}.key.serde", ss.system, ss.stream))
    }

    pub fn msg_serde(&self, ss: &SystemStream) -> Option<&str> {
        self.0
            .get(&format!("streams.{}.{}.msg.serde", ss.system, ss.stream))
    }

    /// When true, checkpointed offsets for this stream are ignored on every
    /// container start and the stream restarts from its reset policy.
    pub fn reset_offset(&self, ss: &SystemStream) -> Result<bool> {
        self.0.get_bool(
            &format!("streams.{}.{}.reset.offset", ss.system, ss.stream),
            false,
        )
    }

    pub fn offset_default(&self, ss: &SystemStream) -> Result<OffsetReset> {
        let key = format!("streams.{}.{}.offset.default", ss.system, ss.stream);
        match self.0.get(&key) {
            None => Ok(OffsetReset::Earliest),
            Some("earliest") => Ok(OffsetReset::Earliest),
            Some("latest") => Ok(OffsetReset::Latest),
            Some(other) => Err(Error::config(
                key,
                format!("expected 'earliest' or 'latest', got '{}'", other),
            )),
        }
    }

    /// Streams carrying a per-stream codec override, for serde wiring.
    pub fn streams_with_serde_overrides(&self) -> Vec<SystemStream> {
        let mut found = Vec::new();
        for key in self.0.keys_with_prefix("streams.") {
            let rest = match key.strip_prefix("streams.") {
                Some(rest) => rest,
                None => continue,
            };
            let stripped = rest
                .strip_suffix(".key.serde")
                .or_else(|| rest.strip_suffix(".msg.serde"));
            if let Some(identifier) = stripped {
                if let Ok(ss) = SystemStream::parse(identifier) {
                    if !found.contains(&ss) {
                        found.push(ss);
                    }
                }
            }
        }
        found
    }
}

// =============================================================================
// Store configuration
// =============================================================================

pub struct StoreConfig<'a>(&'a Config);

impl<'a> StoreConfig<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self(config)
    }

    /// All stores declared in config, sorted.
    pub fn store_names(&self) -> Vec<String> {
        self.0
            .keys_with_prefix("stores.")
            .into_iter()
            .filter_map(|key| {
                let middle = key.strip_prefix("stores.")?.strip_suffix(".factory")?;
                (!middle.contains('.')).then(|| middle.to_string())
            })
            .collect()
    }

    pub fn factory(&self, store: &str) -> Result<&str> {
        let key = format!("stores.{}.factory", store);
        self.0
            .get(&key)
            .ok_or_else(|| Error::config(key, "required key missing"))
    }

    pub fn changelog(&self, store: &str) -> Result<Option<SystemStream>> {
        match self.0.get(&format!("stores.{}.changelog", store)) {
            None => Ok(None),
            Some(raw) => SystemStream::parse(raw).map(Some),
        }
    }

    pub fn key_serde(&self, store: &str) -> Option<&str> {
        self.0.get(&format!("stores.{}.key.serde", store))
    }

    pub fn msg_serde(&self, store: &str) -> Option<&str> {
        self.0.get(&format!("stores.{}.msg.serde", store))
    }
}

// =============================================================================
// Serializer configuration
// =============================================================================

pub struct SerializerConfig<'a>(&'a Config);

impl<'a> SerializerConfig<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self(config)
    }

    /// Factory backing a codec name. A name without an explicit registry
    /// entry resolves to the factory of the same name (the built-ins).
    pub fn factory<'b>(&self, serde_name: &'b str) -> &'b str
    where
        'a: 'b,
    {
        self.0
            .get(&format!("serializers.registry.{}.factory", serde_name))
            .unwrap_or(serde_name)
    }
}

// =============================================================================
// Metrics configuration
// =============================================================================

pub struct MetricsConfig<'a>(&'a Config);

impl<'a> MetricsConfig<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self(config)
    }

    pub fn reporters(&self) -> Vec<String> {
        self.0.get_list("metrics.reporters")
    }

    pub fn reporter_factory(&self, name: &str) -> Result<&str> {
        let key = format!("metrics.reporter.{}.factory", name);
        self.0
            .get(&key)
            .ok_or_else(|| Error::config(key, "required key missing"))
    }

    pub fn interval(&self) -> Result<Duration> {
        let ms = self.0.get_i64("metrics.interval.ms", 60_000)?;
        Ok(Duration::from_millis(ms.max(1) as u64))
    }
}

// =============================================================================
// Container configuration
// =============================================================================

pub struct ContainerConfig<'a>(&'a Config);

impl<'a> ContainerConfig<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self(config)
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(self.0.get("container.state.dir").unwrap_or("./state"))
    }

    /// Bounded no-new-message wait inside `SystemConsumers::choose`.
    pub fn poll_timeout(&self) -> Result<Duration> {
        let ms = self.0.get_i64("container.poll.timeout.ms", 10)?;
        Ok(Duration::from_millis(ms.max(0) as u64))
    }

    /// Buffered envelopes per partition at which fetching pauses.
    pub fn queue_high_watermark(&self) -> Result<usize> {
        let n = self.0.get_i64("container.queue.high.watermark", 1024)?;
        if n <= 0 {
            return Err(Error::config(
                "container.queue.high.watermark",
                "must be positive",
            ));
        }
        Ok(n as usize)
    }

    /// Buffered envelopes per partition at which fetching resumes.
    pub fn queue_low_watermark(&self) -> Result<usize> {
        let n = self.0.get_i64("container.queue.low.watermark", 256)?;
        if n < 0 {
            return Err(Error::config(
                "container.queue.low.watermark",
                "must not be negative",
            ));
        }
        Ok(n as usize)
    }

    pub fn diagnostics_port(&self) -> Result<Option<u16>> {
        match self.0.get("container.diagnostics.port") {
            None => Ok(None),
            Some(raw) => raw.parse::<u16>().map(Some).map_err(|_| {
                Error::config(
                    "container.diagnostics.port",
                    format!("expected port number, got '{}'", raw),
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Config {
        Config::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_from_json_stringifies_scalars() {
        let cfg = Config::from_json(
            r#"{"task.commit.ms": 0, "task.drop.deserialization.errors": true, "task.inputs": "sys.s"}"#,
        )
        .unwrap();
        assert_eq!(cfg.get("task.commit.ms"), Some("0"));
        assert_eq!(cfg.get("task.drop.deserialization.errors"), Some("true"));
        assert_eq!(cfg.get("task.inputs"), Some("sys.s"));
    }

    #[test]
    fn test_from_json_rejects_non_scalar() {
        let err = Config::from_json(r#"{"task.inputs": ["a"]}"#).unwrap_err();
        assert!(err.to_string().contains("task.inputs"));
    }

    #[test]
    fn test_required_key_errors_name_the_key() {
        let cfg = config(&[]);
        let err = TaskConfig::new(&cfg).task_factory().unwrap_err();
        assert!(err.to_string().contains("task.factory"));
    }

    #[test]
    fn test_inputs_parse_and_reject_empty() {
        let cfg = config(&[("task.inputs", "kafka.orders, kafka.payments")]);
        let inputs = TaskConfig::new(&cfg).inputs().unwrap();
        assert_eq!(
            inputs,
            vec![
                SystemStream::new("kafka", "orders"),
                SystemStream::new("kafka", "payments"),
            ]
        );

        let cfg = config(&[("task.inputs", " , ")]);
        assert!(TaskConfig::new(&cfg).inputs().is_err());
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        let task = TaskConfig::new(&cfg);
        assert_eq!(task.window_ms().unwrap(), -1);
        assert_eq!(task.commit_ms().unwrap(), 60_000);
        assert_eq!(task.chooser_factory(), "round-robin");
        assert!(!task.drop_deserialization_errors().unwrap());
        assert!(task.checkpoint_factory().is_none());

        let stream = StreamConfig::new(&cfg);
        let ss = SystemStream::new("sys", "s");
        assert_eq!(stream.offset_default(&ss).unwrap(), OffsetReset::Earliest);
        assert!(!stream.reset_offset(&ss).unwrap());
    }

    #[test]
    fn test_system_and_store_enumeration() {
        let cfg = config(&[
            ("systems.kafka.factory", "in-memory"),
            ("systems.wire.factory", "in-memory"),
            ("systems.kafka.key.serde", "string"),
            ("stores.kv.factory", "in-memory"),
            ("stores.kv.changelog", "kafka.kv-log"),
        ]);
        assert_eq!(SystemConfig::new(&cfg).system_names(), vec!["kafka", "wire"]);
        assert_eq!(StoreConfig::new(&cfg).store_names(), vec!["kv"]);
        assert_eq!(
            StoreConfig::new(&cfg).changelog("kv").unwrap(),
            Some(SystemStream::new("kafka", "kv-log"))
        );
    }

    #[test]
    fn test_stream_serde_override_enumeration() {
        let cfg = config(&[
            ("streams.kafka.orders.msg.serde", "json"),
            ("streams.kafka.orders.key.serde", "string"),
            ("streams.wire.raw.feed.msg.serde", "json"),
        ]);
        let streams = StreamConfig::new(&cfg).streams_with_serde_overrides();
        assert!(streams.contains(&SystemStream::new("kafka", "orders")));
        // The stream name keeps everything after the first dot.
        assert!(streams.contains(&SystemStream::new("wire", "raw.feed")));
    }

    #[test]
    fn test_invalid_bool_and_int_name_key() {
        let cfg = config(&[("task.window.ms", "soon")]);
        let err = TaskConfig::new(&cfg).window_ms().unwrap_err();
        assert!(err.to_string().contains("task.window.ms"));

        let cfg = config(&[("task.drop.deserialization.errors", "yes")]);
        assert!(TaskConfig::new(&cfg)
            .drop_deserialization_errors()
            .is_err());
    }
}
