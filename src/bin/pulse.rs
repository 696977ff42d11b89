use clap::Parser;
use relay_pulse::config::read_config_file;
use relay_pulse::runtime::PulseRuntime;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("relay_pulse", LevelFilter::TRACE),
        ("sqlx", LevelFilter::WARN),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    dotenv::dotenv().ok();

    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.config)?;
    let runtime = PulseRuntime::start(config).await?;

    info!("monitoring active, press Ctrl+C to shutdown gracefully");

    wait_for_shutdown(&runtime, &args.config).await;

    info!("received shutdown signal, stopping");
    runtime.shutdown().await?;

    Ok(())
}

/// Block until Ctrl+C; on unix, SIGHUP re-reads the config file and hot
/// reloads it (a broken file keeps the previous generation active).
#[cfg(unix)]
async fn wait_for_shutdown(runtime: &PulseRuntime, config_path: &str) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("unable to install SIGHUP handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("unable to listen for shutdown signal: {e}");
                }
                return;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match read_config_file(config_path) {
                    Ok(config) => {
                        if let Err(e) = runtime.reload(config).await {
                            error!("reload rejected, previous configuration stays active: {e:#}");
                        }
                    }
                    Err(e) => error!("cannot read config file: {e:#}"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_runtime: &PulseRuntime, _config_path: &str) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("unable to listen for shutdown signal: {e}");
    }
}
