//! fleet-bootstrap: trust bootstrap for a fleet agent deployment
//!
//! Creates the deployment CA, the CA-signed server certificate, the
//! server/client configuration pair and the signed startup manifest in a
//! configuration directory. Safe to re-run: existing material is reused.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use fleet_bootstrap::commands::initialize::handle_initialize;
use fleet_bootstrap::configs::BootstrapSettings;
use fleet_bootstrap::configuration::DEFAULT_WRITEBACK_PATH;
use fleet_bootstrap::deployment::{
    HttpDeployment, ObjectStoreDeployment, ServiceAccount, DEFAULT_BIND_ADDRESS,
    DEFAULT_BIND_PORT, DEFAULT_STORAGE_ENDPOINT,
};

/// Bootstrap trust for a fleet agent deployment
#[derive(Parser, Debug)]
#[command(name = "fleet-bootstrap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (TOML) with CA subject and key parameters
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory for keys, certificates and configuration files
    config_dir: PathBuf,

    /// Where clients keep their local state
    #[arg(long, default_value = DEFAULT_WRITEBACK_PATH)]
    client_writeback_path: String,

    /// Labels applied to every client (All is always added)
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    labels: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a deployment whose manifest lives in a storage bucket
    #[command(alias = "init-object-store")]
    InitializeObjectStore {
        #[command(flatten)]
        common: CommonArgs,

        /// Bucket the manifest is uploaded to
        #[arg(long)]
        bucket: String,

        /// Service account JSON key file
        #[arg(long)]
        service_account_path: PathBuf,

        /// Storage API endpoint
        #[arg(long, default_value = DEFAULT_STORAGE_ENDPOINT)]
        storage_endpoint: String,
    },

    /// Initialize a deployment served by the agent HTTP frontend
    #[command(alias = "init-http")]
    InitializeHttp {
        #[command(flatten)]
        common: CommonArgs,

        /// Public URL of the frontend (defaults to http://BIND_ADDRESS:BIND_PORT/)
        #[arg(long)]
        base_url: Option<String>,

        /// Address the frontend binds to
        #[arg(long, default_value = DEFAULT_BIND_ADDRESS)]
        bind_address: String,

        /// Port the frontend binds to
        #[arg(long, default_value_t = DEFAULT_BIND_PORT)]
        bind_port: u16,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .with_writer(std::io::stderr)
        .init();

    let settings = BootstrapSettings::load(cli.settings.as_deref())
        .context("Failed to load bootstrap settings")?;
    debug!(?settings, "loaded settings");

    match cli.command {
        Commands::InitializeObjectStore {
            common,
            bucket,
            service_account_path,
            storage_endpoint,
        } => {
            let service_account = ServiceAccount::from_file(&service_account_path)
                .with_context(|| {
                    format!(
                        "Failed to read service account {}",
                        service_account_path.display()
                    )
                })?;
            let deployment = ObjectStoreDeployment::new(bucket, service_account)
                .context("Failed to create storage client")?
                .storage_endpoint(storage_endpoint);

            handle_initialize(
                &common.config_dir,
                &deployment,
                &settings,
                &common.labels,
                &common.client_writeback_path,
            )?;
        }

        Commands::InitializeHttp {
            common,
            base_url,
            bind_address,
            bind_port,
        } => {
            let deployment = HttpDeployment::new(base_url.as_deref(), &bind_address, bind_port)
                .context("Invalid HTTP deployment parameters")?;

            handle_initialize(
                &common.config_dir,
                &deployment,
                &settings,
                &common.labels,
                &common.client_writeback_path,
            )?;
        }
    }

    Ok(())
}
