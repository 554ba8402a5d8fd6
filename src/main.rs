//! Halberd - browser-driven web vulnerability scanner CLI

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use url::Url;

use halberd::browser::BrowserType;
use halberd::config;
use halberd::engine::{CancelToken, ScanEngine};
use halberd::models::{EngineConfig, Severity, Vulnerability};
use halberd::plugins::registry;
use halberd::report;

/// Halberd - browser-driven web vulnerability scanner
#[derive(Parser)]
#[command(name = "halberd", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan one or more URLs
    Scan {
        /// Target URL (repeatable)
        #[arg(short, long, required = true)]
        url: Vec<String>,

        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Plugin activation list (`name,true|false` per line)
        #[arg(short, long)]
        plugins: Option<PathBuf>,

        /// Plugins to enable (comma-separated); overrides the activation list
        #[arg(short, long, value_delimiter = ',')]
        enable: Option<Vec<String>>,

        /// Use the `<name>_full` payload sets where available
        #[arg(long)]
        full_payloads: bool,

        /// Intercepting proxy port (0 disables the listener)
        #[arg(long)]
        proxy_port: Option<u16>,

        /// Browsers to provision for the default browser type
        #[arg(short, long)]
        browsers: Option<usize>,

        /// Browser type used for requests (http, chrome, firefox, edge)
        #[arg(long)]
        browser: Option<BrowserType>,

        /// Directory of payload files
        #[arg(long)]
        payloads: Option<PathBuf>,

        /// Global header injected into every request (format: "Key: Value")
        #[arg(short = 'H', long)]
        header: Option<Vec<String>>,

        /// Disable the sub-resource cache
        #[arg(long)]
        no_cache: bool,

        /// Output file path for the JSON report
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// List available plugins
    Plugins,
}

fn output_name_from_target(target: &str) -> String {
    if let Ok(url) = Url::parse(target) {
        let host = url.host_str().unwrap_or("unknown");
        let sanitized: String = host
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect();
        format!("halberd_{sanitized}.json")
    } else {
        "halberd_report.json".to_string()
    }
}

fn print_summary(vulnerabilities: &[Vulnerability]) {
    let severities = [
        (Severity::Critical, "Critical"),
        (Severity::High, "High"),
        (Severity::Medium, "Medium"),
        (Severity::Low, "Low"),
        (Severity::Info, "Info"),
    ];

    println!("\n{}", "  Scan Summary".bold());
    println!("  {}", "─".repeat(35));

    let mut builder = Builder::default();
    builder.push_record(["Severity", "Count"]);
    let count = |level: Severity| vulnerabilities.iter().filter(|v| v.level == level).count();
    for (severity, label) in &severities {
        builder.push_record([label.to_string(), count(*severity).to_string()]);
    }
    builder.push_record(["Total".to_string(), vulnerabilities.len().to_string()]);

    let mut table = builder.build();
    table.with(Style::rounded());
    println!("{table}");

    println!(
        "\n  {} {} {} {} {}",
        format!("{} Critical", count(Severity::Critical)).red().bold(),
        format!("{} High", count(Severity::High)).bright_red(),
        format!("{} Medium", count(Severity::Medium)).yellow(),
        format!("{} Low", count(Severity::Low)).blue(),
        format!("{} Info", count(Severity::Info)).white(),
    );
}

/// Enabled plugins: `--enable`, else the activation list, else every plugin
fn enabled_plugins(
    enable: Option<Vec<String>>,
    config: &EngineConfig,
) -> Result<HashSet<String>, Box<dyn std::error::Error>> {
    if let Some(names) = enable {
        return Ok(names.into_iter().map(|n| n.trim().to_lowercase()).collect());
    }
    if let Some(path) = &config.plugins_file {
        return Ok(config::load_active_plugins(path)?);
    }
    Ok(registry()
        .iter()
        .map(|p| p.describe().name.to_string())
        .collect())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            url,
            config: config_path,
            plugins,
            enable,
            full_payloads,
            proxy_port,
            browsers,
            browser,
            payloads,
            header,
            no_cache,
            output,
            verbose,
        } => {
            let filter = if verbose { "halberd=debug" } else { "halberd=info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
                )
                .with_target(false)
                .init();

            let mut engine_config = match config_path {
                Some(ref path) => config::load_config(path)?,
                None => {
                    let default_path = Path::new("config/halberd.toml");
                    if default_path.exists() {
                        config::load_config(default_path)?
                    } else {
                        EngineConfig::default()
                    }
                }
            };
            config::merge_cli_args(
                &mut engine_config,
                proxy_port,
                browsers,
                browser,
                payloads,
                plugins,
                header,
                no_cache,
            );

            let enabled = enabled_plugins(enable, &engine_config)?;
            let mut enabled_names: Vec<&str> = enabled.iter().map(String::as_str).collect();
            enabled_names.sort_unstable();

            println!("  {} {}", "Targets:".bold(), url.join(", ").green());
            println!("  {} {}", "Plugins:".bold(), enabled_names.join(", ").cyan());
            println!(
                "  {} {}\n",
                "Proxy:".bold(),
                format!("127.0.0.1:{}", engine_config.proxy_port).cyan()
            );

            let engine = ScanEngine::bootstrap(engine_config).await?;

            let cancel = CancelToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing in-flight requests");
                    on_ctrl_c.cancel();
                }
            });

            let vulnerabilities = engine
                .start_engine(&url, &enabled, full_payloads, verbose, cancel)
                .await;
            engine.shutdown().await;

            print_summary(&vulnerabilities);

            let output_path = output.unwrap_or_else(|| {
                PathBuf::from(output_name_from_target(
                    url.first().map(String::as_str).unwrap_or_default(),
                ))
            });
            report::json::export(&vulnerabilities, &output_path)?;
            println!(
                "\n  {} {}",
                "Report saved to:".bold(),
                output_path.display().to_string().green()
            );
        }

        Commands::Plugins => {
            println!("  {}\n", "Available Plugins:".bold());
            for plugin in registry() {
                let descriptor = plugin.describe();
                println!(
                    "    {} {} {}",
                    format!("{:12}", descriptor.name).cyan().bold(),
                    format!("{:10}", descriptor.kind.to_string()).yellow(),
                    descriptor.description
                );
            }
            println!();
        }
    }

    Ok(())
}
