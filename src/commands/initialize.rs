use std::path::Path;

use anyhow::{Context, Result};

use crate::bootstrap::{Bootstrap, BootstrapOutcome, ConsoleProgress};
use crate::configs::BootstrapSettings;
use crate::configuration::Labels;
use crate::crypto_provider::OpenSslProvider;
use crate::deployment::DeploymentPolicy;

/// Handle the `initialize-*` commands
///
/// This command:
/// 1. Provisions (or reuses) the CA and the CA-signed server certificate
/// 2. Writes the server and client configuration documents
/// 3. Verifies and publishes the signed startup manifest
///
/// Progress is printed to stdout, ending with the manifest and `Done!`.
///
/// # Arguments
///
/// * `config_dir` - Directory holding keys, certificates and configuration
/// * `deployment` - Selected deployment policy
/// * `settings` - Operator settings (CA subject, key size)
/// * `labels` - Client labels; `All` is always added
/// * `writeback_path` - Client-side state file path
///
/// # Example
/// ```no_run
/// use fleet_bootstrap::commands::initialize::handle_initialize;
/// use fleet_bootstrap::configs::BootstrapSettings;
/// use fleet_bootstrap::deployment::HttpDeployment;
///
/// let deployment = HttpDeployment::new(None, "127.0.0.1", 8000)?;
/// let settings = BootstrapSettings::default();
/// handle_initialize(
///     "/etc/fleet-agent/deploy".as_ref(),
///     &deployment,
///     &settings,
///     &["lab-machines".to_string()],
///     "/etc/fleet-agent/agent.local.json",
/// )?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn handle_initialize(
    config_dir: &Path,
    deployment: &dyn DeploymentPolicy,
    settings: &BootstrapSettings,
    labels: &[String],
    writeback_path: &str,
) -> Result<BootstrapOutcome> {
    println!("\n═══════════════════════════════════════════════════════════════");
    println!("  INITIALIZING FLEET AGENT DEPLOYMENT");
    println!("═══════════════════════════════════════════════════════════════\n");

    println!("📁 Config directory: {}", config_dir.display());
    println!("🌐 Deployment: {}", deployment.kind());
    println!("\n⏳ Processing...\n");

    let provider = OpenSslProvider::new(settings.keys.bits);
    let outcome = Bootstrap::new(config_dir, settings, &provider, deployment)
        .labels(Labels::normalize(labels.iter().cloned()))
        .writeback_path(writeback_path)
        .run(&mut ConsoleProgress)
        .with_context(|| format!("Failed to initialize {}", config_dir.display()))?;

    Ok(outcome)
}
