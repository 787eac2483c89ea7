mod exit;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rtcworker::engine::LoopbackEngine;
use rtcworker::settings::{parse_duration, parse_rtc_configuration, DEFAULT_BUFFERED_AMOUNT_INTERVAL};
use rtcworker::transport::{Endpoints, DEFAULT_CHANNEL_FD};
use rtcworker::{Worker, WorkerSettings};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::exit::{CliResult, SUCCESS};
use crate::logging::{init_logging, LogFormat, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "rtcworker",
    version,
    about = "Media worker serving a host over inherited descriptors"
)]
struct Cli {
    /// Minimum log level (stderr).
    #[arg(
        long = "logLevel",
        visible_alias = "log-level",
        value_name = "LEVEL",
        env = "RTCWORKER_LOG_LEVEL",
        default_value = "error"
    )]
    log_level: LogLevel,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Descriptor the host writes requests to.
    #[arg(long, value_name = "FD", default_value_t = DEFAULT_CHANNEL_FD)]
    read_fd: i32,

    /// Descriptor the worker writes to. Defaults to the read descriptor.
    #[arg(long, value_name = "FD")]
    write_fd: Option<i32>,

    /// Default connection configuration (JSON) for handlers created without one.
    #[arg(
        long = "rtcConfiguration",
        visible_alias = "rtc-configuration",
        value_name = "JSON"
    )]
    rtc_configuration: Option<String>,

    /// Period of the buffered-amount notifications.
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "1s",
        value_parser = parse_duration
    )]
    buffered_amount_interval: Duration,
}

impl Cli {
    fn settings(&self) -> CliResult<WorkerSettings> {
        let rtc_configuration = self
            .rtc_configuration
            .as_deref()
            .map(parse_rtc_configuration)
            .transpose()
            .map_err(|err| exit::settings_error("--rtcConfiguration", err))?;

        Ok(WorkerSettings {
            rtc_configuration,
            buffered_amount_interval: self.buffered_amount_interval,
            ..WorkerSettings::default()
        })
    }

    fn endpoints(&self) -> Endpoints {
        match self.write_fd {
            Some(write_fd) if write_fd != self.read_fd => {
                Endpoints::from_descriptors(self.read_fd, write_fd)
            }
            _ => Endpoints::shared(self.read_fd),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

fn run(cli: Cli) -> CliResult<i32> {
    let settings = cli.settings()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        target = option_env!("RTCWORKER_BUILD_TARGET").unwrap_or("unknown"),
        pid = settings.pid,
        "starting worker"
    );
    if settings.buffered_amount_interval != DEFAULT_BUFFERED_AMOUNT_INTERVAL {
        info!(interval = ?settings.buffered_amount_interval, "custom buffered amount interval");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| exit::io_error("failed to start runtime", err))?;

    runtime.block_on(async {
        let worker = Worker::new(cli.endpoints(), Arc::new(LoopbackEngine::new()), settings);
        tokio::spawn(forward_signals(worker.shutdown_token()));

        worker
            .run()
            .await
            .map_err(|err| exit::worker_error("worker failed", err))?;
        Ok(SUCCESS)
    })
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn forward_signals(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                token.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = terminate.recv() => info!("SIGTERM received"),
            _ = token.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = token.cancelled() => return,
        }
    }
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_host_launch() {
        let cli = Cli::try_parse_from(["rtcworker"]).expect("defaults should parse");
        assert_eq!(cli.read_fd, 3);
        assert_eq!(cli.write_fd, None);
        assert_eq!(cli.log_level, LogLevel::Error);
        assert_eq!(cli.buffered_amount_interval, Duration::from_secs(1));
        assert!(cli.endpoints().is_shared());
    }

    #[test]
    fn accepts_host_spelling() {
        let cli = Cli::try_parse_from([
            "rtcworker",
            "--logLevel",
            "debug",
            "--rtcConfiguration",
            r#"{"iceServers":[{"urls":"stun:stun.example.org"}]}"#,
        ])
        .expect("host flags should parse");

        assert_eq!(cli.log_level, LogLevel::Debug);
        let settings = cli.settings().expect("configuration should be valid");
        assert_eq!(
            settings.rtc_configuration.map(|c| c.ice_servers.len()),
            Some(1)
        );
    }

    #[test]
    fn invalid_configuration_exits_with_42() {
        let cli = Cli::try_parse_from([
            "rtcworker",
            "--rtc-configuration",
            r#"{"iceServers":[{"username":"u"}]}"#,
        ])
        .expect("flag should parse");

        let err = cli.settings().expect_err("configuration should be rejected");
        assert_eq!(err.code, exit::INVALID_SETTINGS);
    }

    #[test]
    fn separate_descriptors() {
        let cli = Cli::try_parse_from(["rtcworker", "--read-fd", "3", "--write-fd", "4"])
            .expect("descriptor flags should parse");
        assert!(!cli.endpoints().is_shared());
    }

    #[test]
    fn rejects_zero_interval() {
        let err = Cli::try_parse_from(["rtcworker", "--buffered-amount-interval", "0s"])
            .expect_err("zero interval should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
