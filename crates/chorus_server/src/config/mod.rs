#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chorus_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::filter::FilterPhase;
use crate::util::secret::SecretString;

/// Default bind endpoint when neither `--bind` nor the config sets one.
pub const DEFAULT_BIND: &str = "ws://127.0.0.1:18300";

/// Default config path: `~/.chorus/server.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chorus").join("server.toml"))
}

/// Load the server config from TOML, then apply `CHORUS_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub subscriptions: SubscriptionSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket bind endpoint (`ws://host:port`).
	pub bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub max_frame_bytes: usize,
	/// Outbound frames buffered per connection before sends wait.
	pub outbound_queue_capacity: usize,
	/// Publish `/system/heartbeat` at this interval when set.
	pub heartbeat_interval: Option<Duration>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: None,
			metrics_bind: None,
			health_bind: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			heartbeat_interval: None,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// HMAC secret for `v1.` signed tokens.
	pub hmac_secret: Option<SecretString>,
	/// Single shared token.
	pub static_token: Option<SecretString>,
	/// User id bound to connections that present `static_token`.
	pub static_user_id: Option<String>,
	/// Accept connections without any credential.
	pub allow_anonymous: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionSettings {
	pub phase: FilterPhase,
	pub dedupe_per_session: bool,
	/// Only paths under these prefixes are subscribed; empty means all.
	pub subscribable_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	subscriptions: FileSubscriptionSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	heartbeat_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAuthSettings {
	hmac_secret: Option<String>,
	static_token: Option<String>,
	static_user_id: Option<String>,
	allow_anonymous: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSubscriptionSettings {
	phase: Option<String>,
	dedupe_per_session: Option<bool>,
	#[serde(default)]
	subscribable_prefixes: Vec<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerSettings::default();

		let phase = match file.subscriptions.phase.as_deref() {
			Some(p) => p.parse::<FilterPhase>().context("subscriptions.phase")?,
			None => FilterPhase::default(),
		};

		Ok(Self {
			server: ServerSettings {
				bind: file.server.bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_frame_bytes),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				heartbeat_interval: file
					.server
					.heartbeat_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs),
			},
			auth: AuthSettings {
				hmac_secret: file.auth.hmac_secret.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				static_token: file.auth.static_token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				static_user_id: file.auth.static_user_id.filter(|s| !s.trim().is_empty()),
				allow_anonymous: file.auth.allow_anonymous.unwrap_or(false),
			},
			subscriptions: SubscriptionSettings {
				phase,
				dedupe_per_session: file.subscriptions.dedupe_per_session.unwrap_or(false),
				subscribable_prefixes: file
					.subscriptions
					.subscribable_prefixes
					.into_iter()
					.map(|p| p.trim().to_string())
					.filter(|p| !p.is_empty())
					.collect(),
			},
		})
	}
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
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_env_overrides_from(cfg, |key| std::env::var(key).ok());
}

fn apply_env_overrides_from(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("CHORUS_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = non_empty("CHORUS_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("CHORUS_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = non_empty("CHORUS_MAX_FRAME_BYTES")
		&& let Ok(max) = v.parse::<usize>()
		&& max > 0
	{
		cfg.server.max_frame_bytes = max;
		info!(max, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = non_empty("CHORUS_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = non_empty("CHORUS_HEARTBEAT_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.server.heartbeat_interval = (secs > 0).then(|| Duration::from_secs(secs));
		info!(secs, "server config: heartbeat_interval overridden by env");
	}

	if let Some(v) = non_empty("CHORUS_AUTH_HMAC_SECRET") {
		cfg.auth.hmac_secret = Some(SecretString::new(v));
		info!("server auth: hmac_secret overridden by env");
	}

	if let Some(v) = non_empty("CHORUS_AUTH_STATIC_TOKEN") {
		cfg.auth.static_token = Some(SecretString::new(v));
		info!("server auth: static_token overridden by env");
	}

	if let Some(v) = non_empty("CHORUS_AUTH_STATIC_USER_ID") {
		cfg.auth.static_user_id = Some(v);
		info!("server auth: static_user_id overridden by env");
	}

	if let Some(v) = non_empty("CHORUS_AUTH_ALLOW_ANONYMOUS")
		&& let Some(allow) = parse_env_bool(&v)
	{
		cfg.auth.allow_anonymous = allow;
		info!(allow, "server auth: allow_anonymous overridden by env");
	}

	if let Some(v) = non_empty("CHORUS_SUBSCRIPTIONS_PHASE") {
		match v.parse::<FilterPhase>() {
			Ok(phase) => {
				cfg.subscriptions.phase = phase;
				info!(%phase, "subscriptions: phase overridden by env");
			}
			Err(e) => warn!(error = %e, "subscriptions: ignoring invalid phase from env"),
		}
	}

	if let Some(v) = non_empty("CHORUS_SUBSCRIPTIONS_DEDUPE")
		&& let Some(dedupe) = parse_env_bool(&v)
	{
		cfg.subscriptions.dedupe_per_session = dedupe;
		info!(dedupe, "subscriptions: dedupe_per_session overridden by env");
	}

	if cfg.auth.allow_anonymous {
		warn!("server auth: anonymous connections are allowed");
	}
}
