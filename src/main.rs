use std::sync::Arc;

use clap::{Parser, Subcommand};

use kvs_relay::config::Config;
use kvs_relay::{
    rlog, FileLogSink, LocalChannels, ProcessLauncher, Result, StreamRequest, StreamService,
    Supervisor,
};

/// kvs-relay - relay an RTSP camera into a WebRTC signaling channel and keep it running
#[derive(Parser, Debug)]
#[command(name = "kvs-relay")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    KVS_RELAY_DEBUG=1        Enable debug logging (alternative to --debug)\n    AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_DEFAULT_REGION\n                             Passed to the worker when not set in relay.toml")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.kvs-relay/kvs-relay.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start streaming a camera and supervise the worker until Ctrl-C
    Run {
        /// Signaling channel name (also the worker target id)
        #[arg(long)]
        stream_name: String,

        /// Camera login
        #[arg(long)]
        camera_id: String,

        /// Camera password
        #[arg(long, env = "KVS_RELAY_CAMERA_PASSWORD", hide_env_values = true)]
        camera_password: String,

        /// Camera IP address or host name
        #[arg(long)]
        camera_ip: String,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    kvs_relay::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Run {
            stream_name,
            camera_id,
            camera_password,
            camera_ip,
        } => run_stream(StreamRequest {
            stream_name,
            camera_id,
            camera_password,
            camera_ip,
        }),
        Command::Config => show_config(),
    }
}

fn run_stream(request: StreamRequest) -> Result<()> {
    rlog!("Run command: {:?}", request);

    let config = Config::load()?;
    let launcher = ProcessLauncher::new(config.launch_settings());
    if !launcher.binary_available() {
        eprintln!(
            "warning: worker binary {} not found; launch will fail",
            launcher.settings().resolved_binary().display()
        );
    }

    let credentials = config.credentials();
    let supervisor = Supervisor::new(launcher, config.supervisor_config(), Arc::new(FileLogSink));
    let service = StreamService::new(
        LocalChannels::new(credentials.region.clone()),
        supervisor,
        credentials,
    );

    let rt = tokio::runtime::Runtime::new()?;
    let ok = rt.block_on(async {
        let response = service.start(&request).await;
        println!("{}", serde_json::to_string_pretty(&response)?);
        if !response.is_success() {
            service.shutdown().await;
            return Ok::<_, kvs_relay::Error>(false);
        }

        if let Some(path) = kvs_relay::log::log_path() {
            println!("Worker output is logged to {}", path.display());
        }
        println!("Supervising {}; press Ctrl-C to stop", request.stream_name);

        tokio::signal::ctrl_c().await?;
        println!("Shutting down...");
        service.shutdown().await;
        rlog!(
            "Stopped after {} automatic relaunches",
            service.supervisor().restart_count()
        );
        Ok(true)
    })?;

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let path = Config::config_path()?;
    let config = Config::load()?;
    println!("# {}", path.display());
    print!("{}", config.to_redacted_toml()?);

    let settings = config.launch_settings();
    let launcher = ProcessLauncher::new(settings.clone());
    println!();
    println!(
        "# worker: {} ({})",
        settings.resolved_binary().display(),
        if launcher.binary_available() {
            "found"
        } else {
            "missing"
        }
    );
    Ok(())
}
