use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use dataset_preseed::config::{self, PreseedConfig};
use dataset_preseed::dataset::StoragePath;
use dataset_preseed::engine;
use dataset_preseed::exec::RunCtx;
use dataset_preseed::notify::NotificationSink;
use dataset_preseed::{Error, Result, report, signal};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to the preseed config TOML
    #[arg(long, short, global = true, default_value = "/etc/dataset-preseed/config.toml")]
    config: PathBuf,
    /// Log output format (stderr)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the preseed gate for a service; exits non-zero if it must not start
    Run {
        /// Service name from [services.<name>]
        service: String,
    },
    /// Print the replication target a dataset inherits
    Resolve {
        /// Dataset path, e.g. tank/services/radarr
        dataset: String,
        #[arg(long)]
        json: bool,
    },
    /// Show preseed state of configured services
    Status {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show what `run` would do, without touching anything
    Plan {
        service: String,
        #[arg(long)]
        json: bool,
    },
    /// Print the fully-resolved TOML (after imports/extends)
    ShowConfig,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_format);
    signal::install_signal_handlers();

    let res = match args.cmd {
        Command::Run { service } => cmd_run(&args.config, &service),
        Command::Resolve { dataset, json } => cmd_resolve(&args.config, &dataset, json),
        Command::Status { service, json } => cmd_status(&args.config, service.as_deref(), json),
        Command::Plan { service, json } => cmd_plan(&args.config, &service, json),
        Command::ShowConfig => cmd_show_config(&args.config),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(kind = ?e.kind(), "{e}");
            ExitCode::from(e.kind().exit_code())
        }
    }
}

fn load(path: &Path) -> Result<PreseedConfig> {
    PreseedConfig::load(path)
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("failed to encode JSON: {e}")))?;
    println!("{s}");
    Ok(())
}

fn cmd_run(path: &Path, service: &str) -> Result<()> {
    let cfg = load(path)?;
    let sink = NotificationSink::from_settings(&cfg.notify)?;
    let out = engine::run_preseed_gate(&cfg, service, &sink, &RunCtx::default())?;
    tracing::info!(
        service,
        method = out.method_used.map(|m| m.as_str()).unwrap_or("none_needed"),
        already_complete = out.already_complete,
        "preseed gate passed"
    );
    Ok(())
}

fn cmd_resolve(path: &Path, dataset: &str, json: bool) -> Result<()> {
    let cfg = load(path)?;
    let dataset: StoragePath = dataset.parse()?;
    let target = cfg.replication_target(&dataset)?;
    if json {
        return print_json(&serde_json::json!({
            "dataset": dataset,
            "replication": target,
        }));
    }
    match target {
        Some(t) => {
            println!("dataset:        {dataset}");
            println!("inherited from: {}", t.source_path);
            println!("target:         {}:{}", t.target_host, t.target_dataset);
            println!("ssh:            {}", t.ssh_destination());
            if let Some(k) = &t.ssh_key_path {
                println!("ssh key:        {k}");
            }
            println!("send options:   {}", t.send_options);
            println!("recv options:   {}", t.recv_options);
        }
        None => println!("{dataset}: no replication configured"),
    }
    Ok(())
}

fn cmd_status(path: &Path, service: Option<&str>, json: bool) -> Result<()> {
    let cfg = load(path)?;
    let rows = report::collect_status(&cfg, service)?;
    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("no services configured");
        return Ok(());
    }
    print!("{}", report::render_table(&rows, chrono::Utc::now()));
    Ok(())
}

fn cmd_plan(path: &Path, service: &str, json: bool) -> Result<()> {
    let cfg = load(path)?;
    let plan = engine::plan_preseed_gate(&cfg, service)?;
    if json {
        return print_json(&plan);
    }
    println!("service:    {}", plan.service);
    println!("dataset:    {}", plan.dataset);
    println!("mountpoint: {}", plan.mountpoint);
    println!("decision:   {:?}", plan.decision);
    println!("timeout:    {}s per attempt", plan.timeout_secs);
    for (i, m) in plan.methods.iter().enumerate() {
        match &m.skip_reason {
            Some(why) => println!("{:>2}. {:<8} skip ({why})", i + 1, m.method.as_str()),
            None => println!("{:>2}. {}", i + 1, m.method.as_str()),
        }
    }
    Ok(())
}

fn cmd_show_config(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    PreseedConfig::from_doc(&doc)?;
    print!("{}", doc.to_pretty_toml()?);
    Ok(())
}
