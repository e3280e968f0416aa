//! Application wiring.
//!
//! # Data Flow
//! ```text
//! RoutewayConfig + registered RouteDefinitions
//!     → store (memory | redis) → Services (limiter, cacher, verifier, rpc client)
//!     → Pipeline::compile for every route, once
//!     → HttpServer and RpcServer share the same Arc<Pipeline>s
//!     → run until Shutdown, then stop the RPC client and the store
//! ```
//!
//! RPC needs a broker: one injected with `with_broker`, or an AMQP broker
//! built from `rpc.url`. Enabling RPC with neither is a startup error.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::config::{ConfigError, RoutewayConfig, StoreKind};
use crate::error::RequestError;
use crate::http::HttpServer;
use crate::lifecycle::Shutdown;
use crate::net::load_tls_config;
use crate::pipeline::{CompileError, Pipeline, RouteDefinition, RouteMethod, Services};
use crate::rpc::{BrokerError, MessageBroker, RpcClient, RpcClientOptions, RpcServer};
use crate::security::{AuthVerifier, RateLimitPolicy};
use crate::store::{DataStore, MemoryStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Unsupported(String),
}

/// A set of routes served over HTTP and, when enabled, RPC.
pub struct App {
    config: RoutewayConfig,
    routes: Vec<RouteDefinition>,
    store: Option<Arc<dyn DataStore>>,
    broker: Option<Arc<dyn MessageBroker>>,
}

impl App {
    /// Create an app with the built-in `health` route registered.
    pub fn new(config: RoutewayConfig) -> Self {
        let health = health_route(&config.app.name);
        Self {
            config,
            routes: vec![health],
            store: None,
            broker: None,
        }
    }

    pub fn route(mut self, route: RouteDefinition) -> Self {
        self.routes.push(route);
        self
    }

    /// Use `store` instead of building one from config.
    pub fn with_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `broker` for RPC instead of connecting to `rpc.url`.
    pub fn with_broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn config(&self) -> &RoutewayConfig {
        &self.config
    }

    pub fn routes(&self) -> &[RouteDefinition] {
        &self.routes
    }

    /// Build the services the stages are compiled against.
    pub fn services(&self, store: Arc<dyn DataStore>, rpc_client: Option<RpcClient>) -> Services {
        let mut services = Services::new(store, &self.config.store.prefix)
            .with_default_rate_limit(RateLimitPolicy::from(&self.config.rate_limit));

        let auth = &self.config.authentication;
        if !auth.secret_key.is_empty() {
            services = services.with_verifier(AuthVerifier::new(
                &auth.secret_key,
                Duration::from_secs(auth.token_lifetime_secs),
            ));
        }
        if let Some(client) = rpc_client {
            services = services.with_rpc_client(client);
        }
        services
    }

    /// Compile every registered route once.
    pub fn compile(&self, services: &Services) -> Result<Vec<Arc<Pipeline>>, CompileError> {
        self.routes
            .iter()
            .map(|route| Pipeline::compile(route, services).map(Arc::new))
            .collect()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), AppError> {
        let broker = if self.config.rpc.enabled {
            Some(self.resolve_broker().await?)
        } else {
            None
        };

        let store = match &self.store {
            Some(store) => store.clone(),
            None => build_store(&self.config).await?,
        };
        store.start().await?;

        let rpc_client = match &broker {
            Some(broker) => {
                let options = RpcClientOptions {
                    call_lifetime: Duration::from_secs(self.config.rpc.call_lifetime_secs),
                };
                Some(RpcClient::start(broker.clone(), options).await?)
            }
            None => None,
        };

        let services = self.services(store.clone(), rpc_client.clone());
        let pipelines = self.compile(&services)?;
        tracing::info!(routes = pipelines.len(), "Routes compiled");

        let rpc_server = broker.map(|broker| {
            let server = RpcServer::new(broker, self.config.rpc.queues.clone(), pipelines.clone());
            tokio::spawn(server.run(shutdown.clone()))
        });

        let http = HttpServer::new(self.config.clone(), &pipelines);
        let served = match &self.config.listener.tls {
            Some(tls) => {
                let addr = self
                    .config
                    .listener
                    .bind_address
                    .parse()
                    .map_err(|e| AppError::Unsupported(format!("invalid bind address: {e}")))?;
                let tls = load_tls_config(tls).await?;
                http.run_tls(addr, tls, shutdown.clone()).await
            }
            None => {
                let listener = TcpListener::bind(&self.config.listener.bind_address).await?;
                http.run(listener, shutdown.clone()).await
            }
        };
        // A failed listener still has to release the RPC side.
        shutdown.trigger();

        if let Some(task) = rpc_server {
            match task.await {
                Ok(Err(e)) => tracing::error!(error = %e, "RPC server failed"),
                Err(e) => tracing::error!(error = %e, "RPC server task panicked"),
                Ok(Ok(())) => {}
            }
        }
        if let Some(client) = rpc_client {
            client.stop().await;
        }
        store.stop().await?;

        served?;
        tracing::info!("Shutdown complete");
        Ok(())
    }

    async fn resolve_broker(&self) -> Result<Arc<dyn MessageBroker>, AppError> {
        if let Some(broker) = &self.broker {
            return Ok(broker.clone());
        }
        match self.config.rpc.url.as_deref() {
            Some(url) => build_broker(url).await,
            None => Err(AppError::Unsupported(
                "rpc.enabled requires rpc.url or a broker passed to App::with_broker".into(),
            )),
        }
    }
}

/// Connect to the AMQP broker at `url`.
#[cfg(feature = "amqp")]
pub async fn build_broker(url: &str) -> Result<Arc<dyn MessageBroker>, AppError> {
    Ok(Arc::new(crate::rpc::AmqpBroker::connect(url).await?))
}

#[cfg(not(feature = "amqp"))]
pub async fn build_broker(_url: &str) -> Result<Arc<dyn MessageBroker>, AppError> {
    Err(AppError::Unsupported(
        "amqp broker requires the `amqp` feature".into(),
    ))
}

/// Build the configured data store.
pub async fn build_store(config: &RoutewayConfig) -> Result<Arc<dyn DataStore>, AppError> {
    match config.store.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "redis")]
        StoreKind::Redis => {
            let url = config
                .store
                .url
                .as_deref()
                .ok_or_else(|| AppError::Unsupported("store.url is required for redis".into()))?;
            Ok(Arc::new(crate::store::RedisStore::connect(url).await?))
        }
        #[cfg(not(feature = "redis"))]
        StoreKind::Redis => Err(AppError::Unsupported(
            "redis store requires the `redis` feature".into(),
        )),
    }
}

/// `GET /health` → `{health: "OK", name, time, uptimeSecs}`
pub fn health_route(name: &str) -> RouteDefinition {
    let name = name.to_string();
    let started = Instant::now();
    RouteDefinition::new("health", RouteMethod::Get, "/health")
        .description("Liveness probe")
        .controller(move |_payload: Value| {
            let body = json!({
                "health": "OK",
                "name": name,
                "time": now_millis(),
                "uptimeSecs": started.elapsed().as_secs(),
            });
            async move { Ok::<_, RequestError>(body) }
        })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
