use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::runtime;
use tracing_subscriber::filter::LevelFilter;

use orrery::allocator::PersistentIdAllocator;
use orrery::config::Config;
use orrery::context::Context;
use orrery::control::{ControlLoop, Dispatcher};
use orrery::instance::manager::InstanceManager;
use orrery::storage::{ServerRow, SqliteStorage, Storage};
use orrery::transport::Transport;

fn main() -> anyhow::Result<()> {
    init_logging().context("unable to initialise logging")?;

    let runtime = runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .thread_name_fn(|| {
            static THREAD_COUNTER: AtomicU16 = AtomicU16::new(1);
            format!("[{}]", THREAD_COUNTER.fetch_add(1, Ordering::Relaxed))
        })
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load().context("loading master configuration")?;
    tracing::info!(port = config.port, external_ip = %config.external_ip, "starting master orchestrator");

    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::connect(&config.sql_connection)
            .await
            .context("connecting to SQL storage")?,
    );

    storage
        .upsert_server(&ServerRow {
            name: "master".to_owned(),
            ip: config.external_ip.clone(),
            port: config.port,
            state: "running".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        })
        .await
        .context("upserting master's own servers row")?;

    let allocator = PersistentIdAllocator::load(Arc::clone(&storage)).await.context("loading persistent-id allocator")?;

    let bind_addr = config.bind_addr().context("resolving bind address")?;
    let transport = Transport::bind(bind_addr).await.context("binding transport listener")?;

    let mut instances = InstanceManager::new(config.world_binary.clone(), config.use_sudo_auth);
    for &map_id in &config.prestart_servers {
        instances
            .launch(map_id, 0, &config.external_ip)
            .await
            .with_context(|| format!("prestarting a world instance for map {map_id}"))?;
    }

    let ctx = Context::new(config, storage);
    let dispatcher = Dispatcher::new(ctx, allocator, instances);

    ControlLoop::new(dispatcher, transport).run().await
}

/// Initialises logging with tokio-console.
#[cfg(feature = "tokio-console")]
fn init_logging() -> anyhow::Result<()> {
    use std::time::Duration;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Layer};

    let console_layer = console_subscriber::Builder::default().retention(Duration::from_secs(1)).recording_path("logs/async.log").spawn();

    let fmt = tracing_subscriber::fmt::layer().with_target(false).with_thread_names(true).with_filter(EnvFilter::from_env("LOG_LEVEL"));

    tracing_subscriber::registry().with(console_layer).with(fmt).init();

    tracing::info!("tokio console enabled");

    Ok(())
}

/// Initialises logging without tokio-console.
#[cfg(not(feature = "tokio-console"))]
fn init_logging() -> anyhow::Result<()> {
    use std::str::FromStr;

    let max_level = LevelFilter::from_str(
        &std::env::vars().find_map(|(k, v)| if k == "LOG_LEVEL" { Some(v) } else { None }).unwrap_or(String::from("info")),
    )?;

    tracing_subscriber::fmt().with_max_level(max_level).with_target(false).with_thread_names(true).with_file(true).pretty().init();

    Ok(())
}
