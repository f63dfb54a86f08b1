#![forbid(unsafe_code)]

mod config;
mod mesh;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow, bail};
use meshchat_domain::SecretString;
use meshchat_protocol::MeshMessage;
use meshchat_util::endpoint::MeshEndpoint;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{MeshBackend, PresenceBackend, QueueBackend, ServerConfig};
use crate::mesh::MeshClient;
use crate::mesh::local::LocalMesh;
use crate::mesh::ws::{WsMeshClient, WsMeshConfig};
use crate::server::dispatcher::{Dispatcher, Services};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::ingest::{DirectIngest, DurableIngest};
use crate::store::credentials::{InMemoryCredentialStore, SqlCredentialStore};
use crate::store::presence::{InMemoryPresenceCounter, SqlPresenceCounter};
use crate::store::queue::{InMemoryDurableQueue, SqlDurableQueue};
use crate::store::verifier::build_verifier;
use crate::store::{CredentialStore, DurableQueue, PresenceCounter, StorePool};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: meshchat_server [--config path] [--add-user name]\n\
\n\
Options:\n\
\t--config    Config file (default: ~/.meshchat/config.toml)\n\
\t--add-user  Add a principal to the credential store and exit\n\
\t            The password is read from the first line of stdin\n\
\t--help      Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config_path: Option<PathBuf>,
	add_user: Option<String>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config_path: None,
		add_user: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config_path = Some(PathBuf::from(v));
			}
			"--add-user" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--add-user must be non-empty");
					usage_and_exit();
				}
				args.add_user = Some(v.trim().to_string());
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,meshchat_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("meshchat_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Credential store and presence counter per `[store]`.
fn build_stores(
	cfg: &ServerConfig,
	pool: Option<&StorePool>,
) -> anyhow::Result<(Arc<dyn CredentialStore>, Arc<dyn PresenceCounter>)> {
	let verifier = build_verifier(cfg.store.credential_scheme, cfg.store.credential_hmac_secret.as_ref())?;

	let credentials: Arc<dyn CredentialStore> = match pool {
		Some(pool) => {
			info!(backend = pool.backend_name(), scheme = %verifier.scheme(), "credential store: sql");
			Arc::new(SqlCredentialStore::new(pool.clone(), verifier))
		}
		None => {
			warn!("credential store: no store.database_url; every auth attempt will fail");
			Arc::new(InMemoryCredentialStore::with_verifier(verifier))
		}
	};

	let presence: Arc<dyn PresenceCounter> = match cfg.store.presence_backend {
		PresenceBackend::Sql => {
			let pool = pool.ok_or_else(|| anyhow!("presence_backend sql requires store.database_url"))?;
			Arc::new(SqlPresenceCounter::new(pool.clone()))
		}
		PresenceBackend::Memory => Arc::new(InMemoryPresenceCounter::new()),
	};

	Ok((credentials, presence))
}

async fn provision_user(cfg: &ServerConfig, pool: Option<&StorePool>, name: &str) -> anyhow::Result<()> {
	let pool = pool.ok_or_else(|| anyhow!("--add-user requires store.database_url"))?;
	let verifier = build_verifier(cfg.store.credential_scheme, cfg.store.credential_hmac_secret.as_ref())?;

	let mut line = String::new();
	BufReader::new(tokio::io::stdin())
		.read_line(&mut line)
		.await
		.context("read password from stdin")?;
	let password = line.trim_end_matches(['\r', '\n']);
	if password.is_empty() {
		bail!("--add-user: empty password");
	}

	let store = SqlCredentialStore::new(pool.clone(), verifier);
	let id = store.provision(name, &SecretString::new(password)).await?;
	info!(%id, name, backend = pool.backend_name(), "provisioned user");
	Ok(())
}

/// Durable queue per `[queue]`; reuses the store pool when both point at the same database.
async fn build_queue(cfg: &ServerConfig, store_pool: Option<&StorePool>) -> anyhow::Result<Arc<dyn DurableQueue>> {
	match cfg.queue.backend {
		QueueBackend::Memory => {
			warn!("durable queue: in-memory backend has no external producers");
			Ok(Arc::new(InMemoryDurableQueue::new()))
		}
		QueueBackend::Sql => {
			let pool = match (cfg.queue.database_url.as_deref(), store_pool) {
				(Some(url), _) if Some(url) != cfg.store.database_url.as_deref() => StorePool::connect(url)
					.await
					.context("connect durable queue database")?,
				(_, Some(pool)) => pool.clone(),
				(_, None) => return Err(anyhow!("queue backend sql requires queue.database_url or store.database_url")),
			};
			info!(backend = pool.backend_name(), queue = %cfg.queue.name, "durable queue: sql");
			Ok(Arc::new(SqlDurableQueue::new(pool, cfg.queue.name.clone())))
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();
	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let store_pool = match cfg.store.database_url.as_deref() {
		Some(url) => Some(StorePool::connect(url).await.context("connect store database")?),
		None => None,
	};

	if let Some(name) = args.add_user.as_deref() {
		return provision_user(&cfg, store_pool.as_ref(), name).await;
	}

	init_metrics(cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				let addr = spawn_health_server(addr, health_state.clone()).await?;
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let (credentials, presence) = build_stores(&cfg, store_pool.as_ref())?;

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

	let (mesh, inbound_rx): (Arc<dyn MeshClient>, Option<mpsc::UnboundedReceiver<MeshMessage>>) = match cfg.mesh.backend {
		MeshBackend::Ws => {
			let endpoint = MeshEndpoint::parse(&cfg.mesh.endpoint)
				.map_err(|e| anyhow!(e))
				.with_context(|| format!("mesh endpoint {}", cfg.mesh.endpoint))?;

			// No receiver without a direct path, so replies to fire-and-forget calls are not queued.
			let (inbound_tx, inbound_rx) = if cfg.mesh.direct_enabled {
				let (tx, rx) = mpsc::unbounded_channel();
				(Some(tx), Some(rx))
			} else {
				(None, None)
			};
			let consume_queues = if cfg.mesh.direct_enabled {
				cfg.mesh.consume_queues.clone()
			} else {
				Vec::new()
			};

			let (client, mesh_task) = WsMeshClient::spawn(
				WsMeshConfig {
					endpoint,
					consume_queues,
					reconnect_min_delay: cfg.mesh.reconnect_min_delay,
					reconnect_max_delay: cfg.mesh.reconnect_max_delay,
					request_timeout: cfg.mesh.request_timeout,
				},
				inbound_tx,
				shutdown_rx.clone(),
			);
			tasks.push(("mesh", mesh_task));
			let client: Arc<dyn MeshClient> = Arc::new(client);
			(client, inbound_rx)
		}
		MeshBackend::Local => {
			warn!("mesh backend: local; substrate calls are only logged in-process");
			let local: Arc<dyn MeshClient> = Arc::new(LocalMesh::new());
			(local, None)
		}
	};

	let dispatcher = Dispatcher::new(Services {
		mesh,
		credentials,
		presence,
	});

	match inbound_rx {
		Some(inbound_rx) => {
			let ingest = DirectIngest::new(dispatcher.clone(), cfg.mesh.context_key);
			tasks.push(("direct", tokio::spawn(ingest.run(inbound_rx, shutdown_rx.clone()))));
		}
		None if cfg.mesh.direct_enabled => info!("direct ingest disabled: local mesh backend has no consume feed"),
		None => info!("direct ingest disabled"),
	}

	if cfg.queue.enabled {
		let queue = build_queue(&cfg, store_pool.as_ref()).await?;
		let ingest = DurableIngest::new(dispatcher.clone(), queue, cfg.queue.pop_timeout, cfg.queue.context_key);
		tasks.push(("durable", tokio::spawn(ingest.run(shutdown_rx.clone()))));
	} else {
		info!("durable ingest disabled");
	}

	if !tasks.iter().any(|(name, _)| matches!(*name, "direct" | "durable")) {
		warn!("both ingestion paths are disabled; no envelopes will be handled");
	}

	health_state.mark_ready();
	info!(backend = ?cfg.mesh.backend, endpoint = %cfg.mesh.endpoint, "meshchat_server: ready");

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("meshchat_server: shutting down");
	health_state.mark_not_ready();
	let _ = shutdown_tx.send(true);

	for (name, task) in tasks {
		if let Err(e) = task.await {
			warn!(task = name, error = %e, "task ended abnormally");
		}
	}

	Ok(())
}
