use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use sydpower::config::{AccountConfig, Config, DEFAULT_SCAN_INTERVAL_SECS};
use sydpower::{Command, Coordinator};

#[derive(Parser, Debug)]
#[command(name = "fossibot")]
#[command(about = "Cloud control client for Fossibot/Sydpower power stations")]
#[command(version)]
struct Args {
    /// Account username (overrides config file)
    #[arg(short, long)]
    username: Option<String>,

    /// Account password (overrides config file)
    #[arg(short, long)]
    password: Option<String>,

    /// Use the developer-mode broker fallback
    #[arg(long)]
    developer_mode: bool,

    /// Poll once, print the device map as JSON, and exit
    #[arg(long)]
    once: bool,

    /// Device id (MAC without colons) targeted by --command or --register
    #[arg(short, long)]
    device: Option<String>,

    /// Named command, e.g. REGEnableUSBOutput or REGDisableLED
    #[arg(short, long)]
    command: Option<String>,

    /// Register address for a validated raw write (requires --value)
    #[arg(long)]
    register: Option<u16>,

    /// Raw value for --register
    #[arg(long)]
    value: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = resolve_config(&args)?;
    let interval = Duration::from_secs(config.account.scan_interval_secs);
    let coordinator = Coordinator::new(
        &config.account.username,
        &config.account.password,
        config.account.developer_mode || args.developer_mode,
        interval,
    );

    // Command mode: connect, send, report, exit
    if let Some(command) = build_command(&args)? {
        let device = args
            .device
            .context("--device is required when sending a command")?;
        coordinator.connect().await?;
        let result = coordinator.run_command(&device, command).await;
        coordinator.shutdown().await;
        return match result {
            Ok(()) => {
                println!("ok");
                Ok(())
            }
            Err(err) => Err(err.into()),
        };
    }

    if args.once {
        coordinator.connect().await?;
        let data = coordinator.refresh().await;
        println!("{}", serde_json::to_string_pretty(&data)?);
        coordinator.shutdown().await;
        return Ok(());
    }

    // Watch mode: background polling plus a JSON snapshot per interval
    coordinator.start().await?;
    loop {
        tokio::time::sleep(interval).await;
        let data = coordinator.data();
        println!("{}", serde_json::to_string_pretty(&data)?);
    }
}

/// Resolves the effective command, if any, from the CLI flags.
fn build_command(args: &Args) -> Result<Option<Command>> {
    match (&args.command, args.register, args.value) {
        (Some(name), None, None) => Ok(Some(Command::Preset(name.clone()))),
        (None, Some(register), Some(value)) => {
            Ok(Some(Command::WriteRegister { register, value }))
        }
        (None, None, None) => Ok(None),
        _ => bail!("use either --command NAME or --register N --value V"),
    }
}

/// Builds config from CLI args, falling back to the config file.
fn resolve_config(args: &Args) -> Result<Config> {
    if let (Some(username), Some(password)) = (args.username.clone(), args.password.clone()) {
        // All credentials provided - use them and save to config
        let config = Config {
            account: AccountConfig {
                username,
                password,
                developer_mode: args.developer_mode,
                scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            },
        };
        config.save().context("failed to save config")?;
        return Ok(config);
    }

    let mut config = Config::load()?.with_context(|| {
        format!(
            "No configuration found. Pass --username and --password once, \
             or create {}",
            Config::config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "the config file".to_string())
        )
    })?;

    if let Some(username) = &args.username {
        config.account.username = username.clone();
    }
    if let Some(password) = &args.password {
        config.account.password = password.clone();
    }
    Ok(config)
}
