use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use beach_harbor_core::{
    run_classifier, Classifier, DesiredStore, Rectifier, RectifierConfig, StoreConfig,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{signal, sync::mpsc, task::JoinError, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod control;
mod sink;
mod telemetry;
mod upstream;

use control::{ControlState, Readiness};
use sink::EventSink;
use upstream::UpstreamConfig;

#[derive(Debug, Clone)]
struct QueueCapacities {
    lines: usize,
    events: usize,
    signals: usize,
    commands: usize,
}

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    upstream: UpstreamConfig,
    store: StoreConfig,
    rectifier: RectifierConfig,
    queues: QueueCapacities,
    redis_url: Option<String>,
    redis_stream: String,
    redis_stream_max_len: usize,
    shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-harbor",
    author,
    version,
    about = "Chat collector that keeps room membership converged with a durable desired set"
)]
struct Cli {
    /// Login of the account whose membership is managed.
    #[arg(long, env = "BEACH_HARBOR_ACCOUNT")]
    account: String,

    /// OAuth token presented during the upstream handshake.
    #[arg(long, env = "BEACH_HARBOR_OAUTH_TOKEN", hide_env_values = true)]
    oauth_token: String,

    /// Upstream chat WebSocket endpoint.
    #[arg(
        long,
        env = "BEACH_HARBOR_UPSTREAM_URL",
        default_value = "wss://irc-ws.chat.twitch.tv:443"
    )]
    upstream_url: String,

    /// Durable desired-room file.
    #[arg(
        long,
        env = "BEACH_HARBOR_CHANNELS_FILE",
        default_value = "state/channels.json"
    )]
    channels_file: PathBuf,

    /// Address for the control and metrics HTTP listener.
    #[arg(
        long,
        env = "BEACH_HARBOR_LISTEN_ADDR",
        default_value = "127.0.0.1:8080"
    )]
    listen_addr: String,

    /// Redis URI for the event stream. Events are only logged when unset.
    #[arg(long, env = "BEACH_HARBOR_REDIS_URL")]
    redis_url: Option<String>,

    #[arg(
        long,
        env = "BEACH_HARBOR_REDIS_STREAM",
        default_value = "beach-harbor:events"
    )]
    redis_stream: String,

    /// Approximate cap on the event stream length.
    #[arg(
        long,
        env = "BEACH_HARBOR_REDIS_STREAM_MAXLEN",
        default_value_t = 100_000
    )]
    redis_stream_max_len: usize,

    #[arg(long, env = "BEACH_HARBOR_LINE_QUEUE", default_value_t = 1000)]
    line_queue: usize,

    #[arg(long, env = "BEACH_HARBOR_EVENT_QUEUE", default_value_t = 1000)]
    event_queue: usize,

    #[arg(long, env = "BEACH_HARBOR_SIGNAL_QUEUE", default_value_t = 64)]
    signal_queue: usize,

    #[arg(long, env = "BEACH_HARBOR_COMMAND_QUEUE", default_value_t = 100)]
    command_queue: usize,

    #[arg(long, env = "BEACH_HARBOR_INTENT_QUEUE", default_value_t = 100)]
    intent_queue: usize,

    /// Outbound JOIN/PART refill rate.
    #[arg(long, env = "BEACH_HARBOR_TOKENS_PER_SECOND", default_value_t = 0.5)]
    tokens_per_second: f64,

    #[arg(long, env = "BEACH_HARBOR_BURST", default_value_t = 2)]
    burst: u32,

    #[arg(long, env = "BEACH_HARBOR_JOIN_TIMEOUT_SECS", default_value_t = 30)]
    join_timeout_secs: u64,

    #[arg(long, env = "BEACH_HARBOR_BACKOFF_MIN_SECS", default_value_t = 2)]
    backoff_min_secs: u64,

    #[arg(long, env = "BEACH_HARBOR_BACKOFF_MAX_SECS", default_value_t = 60)]
    backoff_max_secs: u64,

    #[arg(long, env = "BEACH_HARBOR_TICK_MS", default_value_t = 1000)]
    tick_ms: u64,

    #[arg(long, env = "BEACH_HARBOR_WRITE_DEBOUNCE_MS", default_value_t = 150)]
    write_debounce_ms: u64,

    /// Forget rooms that are neither wanted nor joined.
    #[arg(long, env = "BEACH_HARBOR_PRUNE_IDLE", default_value_t = false)]
    prune_idle: bool,

    /// Time remaining tasks get to finish once shutdown starts.
    #[arg(long, env = "BEACH_HARBOR_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let account = cli.account.trim().to_ascii_lowercase();
        if account.is_empty() {
            bail!("account must not be empty");
        }
        if cli.channels_file.as_os_str().is_empty() {
            bail!("channels file path must not be empty");
        }
        if !(cli.tokens_per_second.is_finite() && cli.tokens_per_second > 0.0) {
            bail!("tokens per second must be positive: {}", cli.tokens_per_second);
        }
        if cli.burst == 0 {
            bail!("burst must be at least 1");
        }
        if cli.backoff_min_secs > cli.backoff_max_secs {
            bail!(
                "backoff minimum ({}s) exceeds maximum ({}s)",
                cli.backoff_min_secs,
                cli.backoff_max_secs
            );
        }
        if cli.tick_ms == 0 {
            bail!("tick must be positive");
        }
        for (name, capacity) in [
            ("line", cli.line_queue),
            ("event", cli.event_queue),
            ("signal", cli.signal_queue),
            ("command", cli.command_queue),
            ("intent", cli.intent_queue),
        ] {
            if capacity == 0 {
                bail!("{name} queue capacity must be positive");
            }
        }

        Ok(ServerConfig {
            listen_addr,
            upstream: UpstreamConfig {
                url: cli.upstream_url,
                login: account.clone(),
                oauth_token: cli.oauth_token,
            },
            store: StoreConfig {
                path: cli.channels_file,
                account,
                write_debounce: Duration::from_millis(cli.write_debounce_ms),
                intent_capacity: cli.intent_queue,
            },
            rectifier: RectifierConfig {
                tokens_per_second: cli.tokens_per_second,
                burst: cli.burst,
                join_timeout: Duration::from_secs(cli.join_timeout_secs),
                backoff_min: Duration::from_secs(cli.backoff_min_secs),
                backoff_max: Duration::from_secs(cli.backoff_max_secs),
                tick: Duration::from_millis(cli.tick_ms),
                prune_idle: cli.prune_idle,
            },
            queues: QueueCapacities {
                lines: cli.line_queue,
                events: cli.event_queue,
                signals: cli.signal_queue,
                commands: cli.command_queue,
            },
            redis_url: cli.redis_url.filter(|url| !url.trim().is_empty()),
            redis_stream: cli.redis_stream,
            redis_stream_max_len: cli.redis_stream_max_len,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        account = %config.store.account,
        channels_file = %config.store.path.display(),
        upstream = %config.upstream.url,
        redis = config.redis_url.is_some(),
        "starting beach-harbor"
    );

    let result = run(config, telemetry.metrics_handle()).await;
    if let Err(err) = &result {
        error!(error = ?err, "beach-harbor exiting after failure");
    }
    result
}

type TaskSet = JoinSet<(&'static str, Result<()>)>;

fn spawn_task<F, E>(tasks: &mut TaskSet, name: &'static str, task: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error>,
{
    tasks.spawn(async move { (name, task.await.map_err(Into::into)) });
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let (store, submit) =
        DesiredStore::open(config.store.clone()).context("failed to open desired-state store")?;
    let desired = store.handle();

    // Bind before anything connects upstream or starts sending commands.
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-harbor control listening on {}", config.listen_addr);

    let sink = match &config.redis_url {
        Some(url) => EventSink::connect_redis(url, config.redis_stream.clone(), config.redis_stream_max_len)
            .await
            .context("failed to connect to redis")?,
        None => EventSink::Log,
    };

    let (line_tx, line_rx) = mpsc::channel(config.queues.lines);
    let (event_tx, event_rx) = mpsc::channel(config.queues.events);
    let (signal_tx, signal_rx) = mpsc::channel(config.queues.signals);
    let (command_tx, command_rx) = mpsc::channel(config.queues.commands);

    let cancel = CancellationToken::new();
    let readiness = Readiness::default();
    let mut tasks = TaskSet::new();

    spawn_task(&mut tasks, "desired-store", store.run(cancel.clone()));
    spawn_task(
        &mut tasks,
        "rectifier",
        Rectifier::new(config.rectifier.clone(), desired.clone(), signal_rx, command_tx)
            .run(cancel.clone()),
    );
    spawn_task(
        &mut tasks,
        "classifier",
        run_classifier(
            Classifier::new(&config.upstream.login),
            line_rx,
            event_tx,
            signal_tx,
            cancel.clone(),
        ),
    );
    let sink_cancel = cancel.clone();
    spawn_task(&mut tasks, "event-sink", async move {
        sink::run_sink(sink, event_rx, sink_cancel).await;
        Ok::<(), anyhow::Error>(())
    });
    spawn_task(
        &mut tasks,
        "upstream",
        upstream::run_upstream(
            config.upstream.clone(),
            line_tx,
            command_rx,
            readiness.clone(),
            cancel.clone(),
        ),
    );

    let router = control::build_router(Arc::new(ControlState {
        submit,
        desired,
        readiness,
        metrics,
    }));
    let http_cancel = cancel.clone();
    spawn_task(&mut tasks, "http", async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    let mut failure = None;
    tokio::select! {
        _ = signal::ctrl_c() => info!("shutdown signal received"),
        Some(joined) = tasks.join_next() => record_exit(joined, &mut failure),
    }
    cancel.cancel();

    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            record_exit(joined, &mut failure);
        }
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!(
            grace_seconds = config.shutdown_grace.as_secs(),
            "tasks still running after grace period; aborting"
        );
        tasks.abort_all();
    }
    info!("shutdown complete");

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn record_exit(
    joined: Result<(&'static str, Result<()>), JoinError>,
    failure: &mut Option<anyhow::Error>,
) {
    match joined {
        Ok((name, Ok(()))) => info!(task = name, "task exited"),
        Ok((name, Err(err))) => {
            error!(task = name, error = %err, "task failed");
            failure.get_or_insert(err.context(format!("{name} task failed")));
        }
        Err(err) => {
            error!(error = %err, "task panicked or was cancelled");
            failure.get_or_insert(anyhow::Error::new(err).context("task join failed"));
        }
    }
}
