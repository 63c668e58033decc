use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use hookhost::binding::{FunctionBinding, HostAssembly, HostType, LibraryBinding, ParamType, TypeKind};
use hookhost::command::Command;
use hookhost::config::HostConfig;
use hookhost::{HostValue, PluginHost};

/// Hookhost - load Lua plugins and drive them with hooks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Plugin directory, overrides the configuration
    #[arg(short, long)]
    plugins: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Do not reload plugins when their files change
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so hook results on stdout stay clean
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set global default subscriber")?;

    let mut config = if let Some(config_path) = args.config {
        HostConfig::load_from_file(&config_path)?
    } else {
        HostConfig::load_default()?
    };
    if let Some(dir) = args.plugins {
        config.plugins.directory = dir;
    }
    if args.no_watch {
        config.plugins.watch = false;
    }

    let mut host = PluginHost::new(&config)?;
    let report = host.bind_surface(&host_assemblies());
    info!("Exposed {} host types to scripts", report.bound.len());
    host.register_library(server_library())?;
    host.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pump = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = pump.tick() => {
                host.pump();
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match Command::parse(&line) {
                    None => {}
                    Some(Err(usage)) => eprintln!("{usage}"),
                    Some(Ok(Command::Quit)) => break,
                    Some(Ok(Command::List)) => {
                        for plugin in host.manager().plugins() {
                            println!(
                                "{} v{} by {} ({})",
                                plugin.title(),
                                plugin.version(),
                                plugin.author(),
                                plugin.filename().display()
                            );
                        }
                    }
                    Some(Ok(Command::Reload(name))) => {
                        if let Err(e) = host.reload(&name) {
                            warn!("Reload of {} failed: {}", name, e);
                        }
                    }
                    Some(Ok(Command::Hook { name, args })) => {
                        host.pump();
                        let result = host.call_hook(&name, &args);
                        println!("{}", serde_json::to_string(&result)?);
                    }
                }
            }
        }
    }

    host.shutdown();
    Ok(())
}

/// Types this host publishes to scripts, subject to the whitelist
fn host_assemblies() -> Vec<HostAssembly> {
    vec![
        HostAssembly::new("Host.Core")
            .with_type(
                HostType::new("Game", "Clock", TypeKind::Reference)
                    .with_static(FunctionBinding::new("Now", |_, _| Ok(HostValue::Int(unix_time())))),
            )
            .with_type(
                HostType::new("Game.Math", "Ops", TypeKind::Reference)
                    .with_static(
                        FunctionBinding::new("Add", |_, args| Ok(HostValue::Int(args.int(0)? + args.int(1)?)))
                            .param("a", ParamType::Int)
                            .param("b", ParamType::Int),
                    )
                    .with_static(
                        FunctionBinding::new("Clamp", |_, args| {
                            let (v, lo, hi) = (args.float(0)?, args.float(1)?, args.float(2)?);
                            Ok(HostValue::Float(v.max(lo).min(hi)))
                        })
                        .param("value", ParamType::Float)
                        .optional("min", ParamType::Float, HostValue::Float(0.0))
                        .optional("max", ParamType::Float, HostValue::Float(1.0)),
                    ),
            )
            .with_type(HostType::new("System", "Int32", TypeKind::Value))
            .with_type(HostType::new("System", "String", TypeKind::String))
            .with_type(HostType::new("System", "Environment", TypeKind::Reference)),
        HostAssembly::new("Host.Runtime").with_type(
            HostType::new("Host", "Interface", TypeKind::Reference).with_static(FunctionBinding::new(
                "Version",
                |_, _| Ok(HostValue::from(env!("CARGO_PKG_VERSION"))),
            )),
        ),
    ]
}

fn server_library() -> LibraryBinding {
    LibraryBinding::new("Server")
        .function(
            FunctionBinding::new("Broadcast", |_, args| {
                info!(target: "server", "[broadcast] {}", args.str(0)?);
                Ok(HostValue::Void)
            })
            .param("message", ParamType::Str),
        )
        .function(FunctionBinding::new("Time", |_, _| Ok(HostValue::Int(unix_time()))))
}

fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
