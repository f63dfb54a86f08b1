#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use meshchat_domain::{ContextKey, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

use crate::store::verifier::CredentialScheme;

const DEFAULT_MESH_ENDPOINT: &str = "ws://127.0.0.1:6787";
const DEFAULT_QUEUE_NAME: &str = "chat";
const DEFAULT_POP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RECONNECT_MIN_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default config path: `~/.meshchat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".meshchat").join("config.toml"))
}

/// Load the server config from TOML at `path` (missing file = defaults), then apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub mesh: MeshSettings,
	pub queue: QueueSettings,
	pub store: StoreSettings,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

/// Substrate connection and the direct ingestion path.
#[derive(Debug, Clone)]
pub struct MeshSettings {
	pub backend: MeshBackend,
	pub endpoint: String,
	pub direct_enabled: bool,
	pub consume_queues: Vec<String>,
	/// Slot the substrate's connection script waits on for direct-path envelopes.
	pub context_key: ContextKey,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub request_timeout: Duration,
}

/// `local` keeps every substrate call in-process and only logs it; for dev runs without a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeshBackend {
	#[default]
	Ws,
	Local,
}

impl MeshBackend {
	fn parse(s: &str) -> Option<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"ws" => Some(MeshBackend::Ws),
			"local" => Some(MeshBackend::Local),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBackend {
	#[default]
	Sql,
	Memory,
}

impl QueueBackend {
	fn parse(s: &str) -> Option<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"sql" => Some(QueueBackend::Sql),
			"memory" => Some(QueueBackend::Memory),
			_ => None,
		}
	}
}

/// Durable ingestion path.
#[derive(Debug, Clone)]
pub struct QueueSettings {
	pub enabled: bool,
	pub backend: QueueBackend,
	/// Falls back to `store.database_url` when unset.
	pub database_url: Option<String>,
	pub name: String,
	/// Upper bound of one blocking pop. Never zero.
	pub pop_timeout: Duration,
	pub context_key: ContextKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceBackend {
	Sql,
	#[default]
	Memory,
}

impl PresenceBackend {
	fn parse(s: &str) -> Option<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"sql" => Some(PresenceBackend::Sql),
			"memory" => Some(PresenceBackend::Memory),
			_ => None,
		}
	}
}

/// Credential store and presence counter.
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
	pub database_url: Option<String>,
	pub credential_scheme: CredentialScheme,
	pub credential_hmac_secret: Option<SecretString>,
	pub presence_backend: PresenceBackend,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	mesh: FileMeshSettings,

	#[serde(default)]
	queue: FileQueueSettings,

	#[serde(default)]
	store: FileStoreSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileMeshSettings {
	backend: Option<String>,
	endpoint: Option<String>,
	direct_enabled: Option<bool>,
	consume_queues: Option<Vec<String>>,
	context_key: Option<String>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileQueueSettings {
	enabled: Option<bool>,
	backend: Option<String>,
	database_url: Option<String>,
	name: Option<String>,
	pop_timeout_secs: Option<u64>,
	context_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStoreSettings {
	database_url: Option<String>,
	credential_scheme: Option<String>,
	credential_hmac_secret: Option<String>,
	presence_backend: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let mesh = MeshSettings {
			backend: parse_or_warn("mesh.backend", file.mesh.backend.as_deref(), MeshBackend::parse).unwrap_or_default(),
			endpoint: file
				.mesh
				.endpoint
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_MESH_ENDPOINT.to_string()),
			direct_enabled: file.mesh.direct_enabled.unwrap_or(true),
			consume_queues: file
				.mesh
				.consume_queues
				.map(|qs| qs.into_iter().filter(|q| !q.trim().is_empty()).collect())
				.unwrap_or_else(|| vec!["chat".to_string(), "conn".to_string()]),
			context_key: parse_or_warn("mesh.context_key", file.mesh.context_key.as_deref(), |s| {
				s.parse::<ContextKey>().ok()
			})
			.unwrap_or(ContextKey::Uid),
			reconnect_min_delay: Duration::from_millis(
				file.mesh.reconnect_min_delay_ms.unwrap_or(DEFAULT_RECONNECT_MIN_MS),
			),
			reconnect_max_delay: Duration::from_millis(
				file.mesh.reconnect_max_delay_ms.unwrap_or(DEFAULT_RECONNECT_MAX_MS),
			),
			request_timeout: Duration::from_millis(file.mesh.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS)),
		};

		let queue = QueueSettings {
			enabled: file.queue.enabled.unwrap_or(false),
			backend: parse_or_warn("queue.backend", file.queue.backend.as_deref(), QueueBackend::parse)
				.unwrap_or_default(),
			database_url: file.queue.database_url.filter(|s| !s.trim().is_empty()),
			name: file
				.queue
				.name
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
			pop_timeout: Duration::from_secs(file.queue.pop_timeout_secs.unwrap_or(DEFAULT_POP_TIMEOUT_SECS)),
			context_key: parse_or_warn("queue.context_key", file.queue.context_key.as_deref(), |s| {
				s.parse::<ContextKey>().ok()
			})
			.unwrap_or(ContextKey::Uid),
		};

		let store = StoreSettings {
			database_url: file.store.database_url.filter(|s| !s.trim().is_empty()),
			credential_scheme: parse_or_warn(
				"store.credential_scheme",
				file.store.credential_scheme.as_deref(),
				|s| s.parse::<CredentialScheme>().ok(),
			)
			.unwrap_or_default(),
			credential_hmac_secret: file
				.store
				.credential_hmac_secret
				.filter(|s| !s.trim().is_empty())
				.map(SecretString::new),
			presence_backend: parse_or_warn(
				"store.presence_backend",
				file.store.presence_backend.as_deref(),
				PresenceBackend::parse,
			)
			.unwrap_or_default(),
		};

		let mut cfg = Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			mesh,
			queue,
			store,
		};
		cfg.normalize();
		cfg
	}

	/// Enforce the invariants the rest of the server relies on.
	fn normalize(&mut self) {
		if self.mesh.reconnect_min_delay > self.mesh.reconnect_max_delay {
			warn!(
				min_ms = self.mesh.reconnect_min_delay.as_millis(),
				max_ms = self.mesh.reconnect_max_delay.as_millis(),
				"mesh config: reconnect_min_delay > reconnect_max_delay; swapping"
			);
			std::mem::swap(&mut self.mesh.reconnect_min_delay, &mut self.mesh.reconnect_max_delay);
		}

		if self.queue.pop_timeout.is_zero() {
			warn!("queue config: pop_timeout_secs = 0 would block forever; using 1");
			self.queue.pop_timeout = Duration::from_secs(1);
		}
	}
}

/// Parse an optional setting; a present but unrecognized value is ignored with a warning.
fn parse_or_warn<T>(setting: &'static str, raw: Option<&str>, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
	let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;
	let parsed = parse(raw);
	if parsed.is_none() {
		warn!(setting, value = raw, "config: ignoring invalid value");
	}
	parsed
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("MESHCHAT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("MESHCHAT_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("MESHCHAT_MESH_BACKEND") {
		match MeshBackend::parse(&v) {
			Some(backend) => {
				cfg.mesh.backend = backend;
				info!(?backend, "mesh config: backend overridden by env");
			}
			None => warn!(value = %v, "mesh config: invalid MESHCHAT_MESH_BACKEND; ignoring"),
		}
	}

	if let Some(v) = var("MESHCHAT_MESH_ENDPOINT") {
		cfg.mesh.endpoint = v;
		info!("mesh config: endpoint overridden by env");
	}

	if let Some(v) = var("MESHCHAT_MESH_DIRECT_ENABLED") {
		match parse_env_bool(&v) {
			Some(enabled) => {
				cfg.mesh.direct_enabled = enabled;
				info!(enabled, "mesh config: direct_enabled overridden by env");
			}
			None => warn!(value = %v, "mesh config: invalid MESHCHAT_MESH_DIRECT_ENABLED; ignoring"),
		}
	}

	if let Some(v) = var("MESHCHAT_MESH_CONTEXT_KEY") {
		match v.parse::<ContextKey>() {
			Ok(key) => {
				cfg.mesh.context_key = key;
				info!(context_key = %key, "mesh config: context_key overridden by env");
			}
			Err(e) => warn!(error = %e, "mesh config: invalid MESHCHAT_MESH_CONTEXT_KEY; ignoring"),
		}
	}

	if let Some(v) = var("MESHCHAT_QUEUE_ENABLED") {
		match parse_env_bool(&v) {
			Some(enabled) => {
				cfg.queue.enabled = enabled;
				info!(enabled, "queue config: enabled overridden by env");
			}
			None => warn!(value = %v, "queue config: invalid MESHCHAT_QUEUE_ENABLED; ignoring"),
		}
	}

	if let Some(v) = var("MESHCHAT_QUEUE_BACKEND") {
		match QueueBackend::parse(&v) {
			Some(backend) => {
				cfg.queue.backend = backend;
				info!(?backend, "queue config: backend overridden by env");
			}
			None => warn!(value = %v, "queue config: invalid MESHCHAT_QUEUE_BACKEND; ignoring"),
		}
	}

	if let Some(v) = var("MESHCHAT_QUEUE_DATABASE_URL") {
		cfg.queue.database_url = Some(v);
		info!("queue config: database_url overridden by env");
	}

	if let Some(v) = var("MESHCHAT_QUEUE_NAME") {
		info!(name = %v, "queue config: name overridden by env");
		cfg.queue.name = v;
	}

	if let Some(v) = var("MESHCHAT_QUEUE_POP_TIMEOUT_SECS") {
		match v.parse::<u64>() {
			Ok(secs) => {
				cfg.queue.pop_timeout = Duration::from_secs(secs);
				info!(secs, "queue config: pop_timeout overridden by env");
			}
			Err(e) => warn!(error = %e, "queue config: invalid MESHCHAT_QUEUE_POP_TIMEOUT_SECS; ignoring"),
		}
	}

	if let Some(v) = var("MESHCHAT_QUEUE_CONTEXT_KEY") {
		match v.parse::<ContextKey>() {
			Ok(key) => {
				cfg.queue.context_key = key;
				info!(context_key = %key, "queue config: context_key overridden by env");
			}
			Err(e) => warn!(error = %e, "queue config: invalid MESHCHAT_QUEUE_CONTEXT_KEY; ignoring"),
		}
	}

	if let Some(v) = var("MESHCHAT_STORE_DATABASE_URL") {
		cfg.store.database_url = Some(v);
		info!("store config: database_url overridden by env");
	}

	if let Some(v) = var("MESHCHAT_CREDENTIAL_SCHEME") {
		match v.parse::<CredentialScheme>() {
			Ok(scheme) => {
				cfg.store.credential_scheme = scheme;
				info!(%scheme, "store config: credential_scheme overridden by env");
			}
			Err(e) => warn!(error = %e, "store config: invalid MESHCHAT_CREDENTIAL_SCHEME; ignoring"),
		}
	}

	if let Some(v) = var("MESHCHAT_CREDENTIAL_HMAC_SECRET") {
		cfg.store.credential_hmac_secret = Some(SecretString::new(v));
		info!("store config: credential_hmac_secret overridden by env");
	}

	if let Some(v) = var("MESHCHAT_PRESENCE_BACKEND") {
		match PresenceBackend::parse(&v) {
			Some(backend) => {
				cfg.store.presence_backend = backend;
				info!(?backend, "store config: presence_backend overridden by env");
			}
			None => warn!(value = %v, "store config: invalid MESHCHAT_PRESENCE_BACKEND; ignoring"),
		}
	}

	cfg.normalize();
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_text: &str) -> ServerConfig {
		let file: FileConfig = toml::from_str(toml_text).expect("toml");
		ServerConfig::from_file(file)
	}

	fn with_env(cfg: &mut ServerConfig, vars: &[(&str, &str)]) {
		let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		apply_overrides(cfg, |k| vars.get(k).cloned());
	}

	#[test]
	fn defaults() {
		let cfg = ServerConfig::default();
		assert_eq!(cfg.mesh.backend, MeshBackend::Ws);
		assert_eq!(cfg.mesh.endpoint, "ws://127.0.0.1:6787");
		assert!(cfg.mesh.direct_enabled);
		assert_eq!(cfg.mesh.consume_queues, vec!["chat", "conn"]);
		assert_eq!(cfg.mesh.context_key, ContextKey::Uid);
		assert_eq!(cfg.mesh.reconnect_min_delay, Duration::from_millis(500));
		assert_eq!(cfg.mesh.reconnect_max_delay, Duration::from_secs(30));
		assert!(!cfg.queue.enabled);
		assert_eq!(cfg.queue.backend, QueueBackend::Sql);
		assert_eq!(cfg.queue.name, "chat");
		assert_eq!(cfg.queue.pop_timeout, Duration::from_secs(10));
		assert_eq!(cfg.store.credential_scheme, CredentialScheme::Plaintext);
		assert_eq!(cfg.store.presence_backend, PresenceBackend::Memory);
		assert!(cfg.server.health_bind.is_none());
	}

	#[test]
	fn file_values_are_read() {
		let cfg = parse(
			r#"
			[server]
			health_bind = "127.0.0.1:9000"

			[mesh]
			endpoint = "wss://mesh.example:443/rpc"
			direct_enabled = false
			consume_queues = ["chat"]

			[queue]
			enabled = true
			backend = "memory"
			name = "events"
			context_key = "user_id"

			[store]
			database_url = "sqlite::memory:"
			credential_scheme = "hmac-sha256"
			credential_hmac_secret = "s3cret"
			presence_backend = "sql"
			"#,
		);

		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:9000"));
		assert_eq!(cfg.mesh.endpoint, "wss://mesh.example:443/rpc");
		assert!(!cfg.mesh.direct_enabled);
		assert_eq!(cfg.mesh.consume_queues, vec!["chat"]);
		assert!(cfg.queue.enabled);
		assert_eq!(cfg.queue.backend, QueueBackend::Memory);
		assert_eq!(cfg.queue.name, "events");
		assert_eq!(cfg.queue.context_key, ContextKey::UserId);
		assert_eq!(cfg.store.credential_scheme, CredentialScheme::HmacSha256);
		assert_eq!(
			cfg.store.credential_hmac_secret.as_ref().map(SecretString::expose),
			Some("s3cret")
		);
		assert_eq!(cfg.store.presence_backend, PresenceBackend::Sql);
	}

	#[test]
	fn invalid_and_blank_values_fall_back() {
		let cfg = parse(
			r#"
			[mesh]
			endpoint = "  "
			context_key = "session"

			[queue]
			backend = "redis"
			name = ""

			[store]
			credential_scheme = "rot13"
			"#,
		);

		assert_eq!(cfg.mesh.endpoint, "ws://127.0.0.1:6787");
		assert_eq!(cfg.mesh.context_key, ContextKey::Uid);
		assert_eq!(cfg.queue.backend, QueueBackend::Sql);
		assert_eq!(cfg.queue.name, "chat");
		assert_eq!(cfg.store.credential_scheme, CredentialScheme::Plaintext);
	}

	#[test]
	fn reconnect_bounds_are_swapped_and_pop_timeout_clamped() {
		let cfg = parse(
			r#"
			[mesh]
			reconnect_min_delay_ms = 9000
			reconnect_max_delay_ms = 100

			[queue]
			pop_timeout_secs = 0
			"#,
		);

		assert_eq!(cfg.mesh.reconnect_min_delay, Duration::from_millis(100));
		assert_eq!(cfg.mesh.reconnect_max_delay, Duration::from_millis(9000));
		assert_eq!(cfg.queue.pop_timeout, Duration::from_secs(1));
	}

	#[test]
	fn env_overrides_file() {
		let mut cfg = parse("[queue]\nenabled = false\n");
		with_env(
			&mut cfg,
			&[
				("MESHCHAT_QUEUE_ENABLED", "yes"),
				("MESHCHAT_QUEUE_BACKEND", "memory"),
				("MESHCHAT_QUEUE_POP_TIMEOUT_SECS", "0"),
				("MESHCHAT_MESH_CONTEXT_KEY", "user_id"),
				("MESHCHAT_MESH_DIRECT_ENABLED", "off"),
				("MESHCHAT_STORE_DATABASE_URL", " sqlite::memory: "),
				("MESHCHAT_HEALTH_BIND", "0.0.0.0:8080"),
			],
		);

		assert!(cfg.queue.enabled);
		assert_eq!(cfg.queue.backend, QueueBackend::Memory);
		assert_eq!(cfg.queue.pop_timeout, Duration::from_secs(1));
		assert_eq!(cfg.mesh.context_key, ContextKey::UserId);
		assert!(!cfg.mesh.direct_enabled);
		assert_eq!(cfg.store.database_url.as_deref(), Some("sqlite::memory:"));
		assert_eq!(cfg.server.health_bind.as_deref(), Some("0.0.0.0:8080"));
	}

	#[test]
	fn invalid_env_values_are_ignored() {
		let mut cfg = ServerConfig::default();
		with_env(
			&mut cfg,
			&[
				("MESHCHAT_QUEUE_ENABLED", "maybe"),
				("MESHCHAT_MESH_BACKEND", "carrier-pigeon"),
				("MESHCHAT_QUEUE_POP_TIMEOUT_SECS", "soon"),
				("MESHCHAT_PRESENCE_BACKEND", "etcd"),
				("MESHCHAT_MESH_ENDPOINT", "   "),
			],
		);

		assert!(!cfg.queue.enabled);
		assert_eq!(cfg.mesh.backend, MeshBackend::Ws);
		assert_eq!(cfg.queue.pop_timeout, Duration::from_secs(10));
		assert_eq!(cfg.store.presence_backend, PresenceBackend::Memory);
		assert_eq!(cfg.mesh.endpoint, "ws://127.0.0.1:6787");
	}

	#[test]
	fn local_mesh_backend_is_selectable() {
		let cfg = parse("[mesh]\nbackend = \"Local\"\n");
		assert_eq!(cfg.mesh.backend, MeshBackend::Local);

		let mut cfg = parse("[mesh]\nbackend = \"bogus\"\n");
		assert_eq!(cfg.mesh.backend, MeshBackend::Ws);
		with_env(&mut cfg, &[("MESHCHAT_MESH_BACKEND", "local")]);
		assert_eq!(cfg.mesh.backend, MeshBackend::Local);
	}

	#[test]
	fn missing_file_is_defaults() {
		let path = std::env::temp_dir().join("meshchat-config-does-not-exist.toml");
		assert!(read_toml_if_exists(&path).expect("read").is_none());
	}
}
