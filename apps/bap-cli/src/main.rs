use anyhow::Context;
use bap_core::BapConfig;
use bap_pkg::manager::{self, PackageManager};
use bap_pkg::metadata;
use bap_pkg::{ARCHIVE_EXTENSION, DEFINITION_FILE};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "bap")]
#[command(about = "Mod package manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a package archive from a source directory
    Pack(PackArgs),
    #[command(flatten)]
    Manage(ManageCommands),
}

/// Commands that operate on the installation root and its database.
#[derive(Subcommand)]
enum ManageCommands {
    /// Install a local archive
    Install { archive: PathBuf },
    /// Remove an installed package
    Uninstall { name: String },
    /// Replace an installed package with a local archive
    Upgrade { archive: PathBuf },
    /// Show an installed package
    Info {
        name: String,
        /// Also list owned files
        #[arg(long)]
        files: bool,
    },
    /// List installed packages
    List {
        #[arg(long)]
        json: bool,
    },
    /// List packages offered by the synced repositories
    Available,
    /// Refresh every repository index
    Sync,
    /// Print the download URL of a package
    Url { name: String },
    /// Download a package archive into the cache
    Download {
        name: String,
        #[arg(short, long)]
        progress: bool,
    },
    /// Download and install a package
    Get {
        name: String,
        /// Upgrade in place if already installed
        #[arg(short, long)]
        upgrade: bool,
        #[arg(short, long)]
        progress: bool,
    },
}

#[derive(Args)]
struct PackArgs {
    /// Directory holding the payload files
    #[arg(default_value = ".")]
    source: PathBuf,
    /// Package definition (default: <source>/pkginfo)
    #[arg(short, long)]
    definition: Option<PathBuf>,
    /// Output archive (default: <name>-<version>.bap)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bap_cli=info,bap_pkg=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = BapConfig::new().context("Failed to load configuration")?;

    let command = match cli.command {
        // Packing never touches the installation root.
        Commands::Pack(args) => return pack(&args).await,
        Commands::Manage(command) => command,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut manager = PackageManager::open(config).await?;
    let outcome = run(&mut manager, command, &cancel).await;
    manager.close().await;
    outcome
}

async fn run(manager: &mut PackageManager, command: ManageCommands, cancel: &CancellationToken) -> anyhow::Result<()> {
    match command {
        ManageCommands::Install { archive } => {
            let info = manager.install(&archive).await?;
            println!("{} {}", "Installed".green().bold(), info);
        }
        ManageCommands::Uninstall { name } => {
            let report = manager.uninstall(&name).await?;
            for path in &report.missing {
                println!("{} {} was already missing", "warning:".yellow().bold(), path.display());
            }
            for path in &report.unremovable {
                println!("{} {} could not be removed", "warning:".yellow().bold(), path.display());
            }
            println!(
                "{} {} ({} files)",
                "Removed".green().bold(),
                report.package,
                report.removed.len()
            );
        }
        ManageCommands::Upgrade { archive } => {
            let info = manager.upgrade(&archive).await?;
            println!("{} {}", "Upgraded".green().bold(), info);
        }
        ManageCommands::Info { name, files } => {
            let pkg = manager.query(&name, files).await?;
            println!("> {}", pkg.name.bold());
            println!("    version:    {}", pkg.version);
            println!("    desc:       {}", pkg.desc);
            if !pkg.depends.is_empty() {
                println!("    depends:    {}", pkg.depends.join(" "));
            }
            if let Some(author) = &pkg.author {
                println!("    author:     {}", author);
            }
            if let Some(maintainer) = &pkg.maintainer {
                println!("    maintainer: {}", maintainer);
            }
            for file in pkg.files.iter().flatten() {
                println!("    {}", file);
            }
        }
        ManageCommands::List { json } => {
            let packages = manager.list_installed().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&packages)?);
            } else if packages.is_empty() {
                println!("No packages installed.");
            } else {
                for pkg in packages {
                    println!("{} {} {}", "●".green(), pkg.name.bold(), pkg.version);
                }
            }
        }
        ManageCommands::Available => {
            let installed = manager.list_installed().await?;
            let available = manager.list_available().await?;
            if available.is_empty() {
                println!("No packages available. Run `bap sync` first.");
            }
            for pkg in available {
                let icon = if installed.iter().any(|i| i.name == pkg.info.name) {
                    "●".green()
                } else {
                    "●".red()
                };
                println!(
                    "{} {}/{} {}",
                    icon,
                    pkg.repository.dimmed(),
                    pkg.info.name.bold(),
                    pkg.info.version
                );
            }
        }
        ManageCommands::Sync => {
            let report = manager.sync(cancel).await?;
            for name in &report.synced {
                println!("{} {}", "Synced".green().bold(), name);
            }
            for (name, err) in &report.failed {
                eprintln!("{} {}: {}", "Failed".red().bold(), name, err);
            }
            if !report.is_complete() {
                anyhow::bail!("{} repositories failed to sync", report.failed.len());
            }
        }
        ManageCommands::Url { name } => {
            println!("{}", manager.resolve_download_url(&name).await?);
        }
        ManageCommands::Download { name, progress } => {
            let path = if progress {
                let (tx, rx) = mpsc::channel(16);
                let (res, _) = tokio::join!(manager.download(&name, Some(tx), cancel), print_progress(rx));
                res?
            } else {
                manager.download(&name, None, cancel).await?
            };
            println!("{} {}", "Downloaded".green().bold(), path.display());
        }
        ManageCommands::Get { name, upgrade, progress } => {
            let info = if progress {
                let (tx, rx) = mpsc::channel(16);
                let (res, _) = tokio::join!(manager.get(&name, upgrade, Some(tx), cancel), print_progress(rx));
                res?
            } else {
                manager.get(&name, upgrade, None, cancel).await?
            };
            info!("Installed {} from repositories", info);
            println!("{} {}", "Installed".green().bold(), info);
        }
    }
    Ok(())
}

async fn pack(args: &PackArgs) -> anyhow::Result<()> {
    let definition = args
        .definition
        .clone()
        .unwrap_or_else(|| args.source.join(DEFINITION_FILE));
    let output = match &args.output {
        Some(path) => path.clone(),
        None => {
            let info = metadata::read_definition(&definition)?;
            PathBuf::from(format!("{}{}", info, ARCHIVE_EXTENSION))
        }
    };
    let info = manager::pack(&args.source, &definition, &output).await?;
    println!("{} {} -> {}", "Packed".green().bold(), info, output.display());
    Ok(())
}

async fn print_progress(mut rx: mpsc::Receiver<u8>) {
    use std::io::Write;

    let mut printed = false;
    while let Some(percent) = rx.recv().await {
        print!("\r{:>3}%", percent);
        let _ = std::io::stdout().flush();
        printed = true;
    }
    if printed {
        println!();
    }
}
