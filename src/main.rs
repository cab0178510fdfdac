//! Share Manager
//!
//! Per-volume NFS export daemon and its control client.
//!
//! ```text
//! share-manager daemon --volume vol-a --fs ext4
//! share-manager share --endpoint http://10.0.0.5:9600 get vol-a
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use share_manager::adapters::{
    pod_node_name, CryptsetupDevice, GaneshaDaemon, HostCommand, KubeLeaseStore, SystemMounter,
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_PID_FILE, DEFAULT_PROBE_TIMEOUT, DEFAULT_STOP_TIMEOUT,
};
use share_manager::api::{self, ShareClient, DEFAULT_LISTEN_ADDR};
use share_manager::domain::CryptoParams;
use share_manager::error::{Error, Result};
use share_manager::nfs::DEFAULT_CONFIG_PATH;
use share_manager::volume::{DEFAULT_EXPORT_ROOT, DEFAULT_GRACE_PERIOD, DEFAULT_LEASE_LIFETIME};
use share_manager::{
    metrics, DataEngine, Dependencies, LeaseCoordinator, ManagerConfig, ShareManager,
    VolumeDescriptor, VolumePaths,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Share Manager - export one storage volume over NFS
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the share manager for one volume
    Daemon(DaemonArgs),
    /// Talk to a running share manager
    Share(ShareArgs),
}

#[derive(Args, Debug)]
struct DaemonArgs {
    /// Volume name
    #[arg(long)]
    volume: String,

    /// Volume is encrypted
    #[arg(long, env = "ENCRYPTED")]
    encrypted: bool,

    /// LUKS passphrase
    #[arg(long, env = "PASSPHRASE", default_value = "", hide_env_values = true)]
    passphrase: String,

    /// LUKS cipher
    #[arg(long, env = "CRYPTOKEYCIPHER")]
    crypto_key_cipher: Option<String>,

    /// LUKS hash
    #[arg(long, env = "CRYPTOKEYHASH")]
    crypto_key_hash: Option<String>,

    /// LUKS key size
    #[arg(long, env = "CRYPTOKEYSIZE")]
    crypto_key_size: Option<String>,

    /// LUKS key derivation function
    #[arg(long, env = "CRYPTOPBKDF")]
    crypto_pbkdf: Option<String>,

    /// Data engine of the volume (v1, v2)
    #[arg(long, env = "DATA_ENGINE", default_value = "v1")]
    data_engine: DataEngine,

    /// Filesystem type
    #[arg(long, default_value = "ext4")]
    fs: String,

    /// Mount option, repeatable
    #[arg(long = "mount", value_name = "OPTION")]
    mount_options: Vec<String>,

    /// Colon separated mkfs options
    #[arg(long, env = "FS_FORMAT_OPTIONS", default_value = "")]
    fs_format_options: String,

    /// Take over the failover lease before serving
    #[arg(long, env = "FAST_FAILOVER")]
    fast_failover: bool,

    /// NFSv4 lease lifetime in seconds
    #[arg(long, env = "LEASE_LIFETIME", default_value_t = DEFAULT_LEASE_LIFETIME)]
    lease_lifetime: u32,

    /// NFSv4 grace period in seconds
    #[arg(long, env = "GRACE_PERIOD", default_value_t = DEFAULT_GRACE_PERIOD)]
    grace_period: u32,

    /// Namespace of this pod
    #[arg(long, env = "POD_NAMESPACE", default_value = "longhorn-system")]
    pod_namespace: String,

    /// Name of this pod, defaults to share-manager-<volume>
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,

    /// Control API bind address
    #[arg(long, env = "LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Ganesha configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,

    /// Directory volumes are mounted and exported under
    #[arg(long, default_value = DEFAULT_EXPORT_ROOT)]
    export_root: PathBuf,

    /// Host /proc to run cryptsetup in the host mount and IPC namespaces
    #[arg(long, env = "HOST_PROC")]
    host_proc: Option<PathBuf>,

    /// Ganesha pid file
    #[arg(long, default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,

    /// Seconds Ganesha gets to exit after SIGTERM
    #[arg(long, default_value_t = DEFAULT_STOP_TIMEOUT.as_secs())]
    nfs_stop_timeout: u64,

    /// Seconds a mount liveness listing may take
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT.as_secs())]
    probe_timeout: u64,

    /// Seconds a host tool (mkfs, mount, cryptsetup) may run
    #[arg(long, default_value_t = DEFAULT_COMMAND_TIMEOUT.as_secs())]
    command_timeout: u64,
}

impl DaemonArgs {
    fn volume_descriptor(&self) -> VolumeDescriptor {
        VolumeDescriptor {
            name: self.volume.clone(),
            encrypted: self.encrypted,
            passphrase: self.passphrase.clone(),
            crypto: CryptoParams {
                cipher: self.crypto_key_cipher.clone(),
                hash: self.crypto_key_hash.clone(),
                key_size: self.crypto_key_size.clone(),
                pbkdf: self.crypto_pbkdf.clone(),
            },
            fs_type: self.fs.clone(),
            mount_options: self.mount_options.clone(),
            format_options: VolumeDescriptor::parse_format_options(&self.fs_format_options),
            data_engine: self.data_engine,
            lease_lifetime: self.lease_lifetime,
            grace_period: self.grace_period,
            fast_failover: self.fast_failover,
        }
    }

    fn pod_name(&self) -> String {
        self.pod_name
            .clone()
            .unwrap_or_else(|| format!("share-manager-{}", self.volume))
    }
}

#[derive(Args, Debug)]
struct ShareArgs {
    /// Control API endpoint of the share manager
    #[arg(long, env = "SHARE_MANAGER_ENDPOINT", default_value = "http://127.0.0.1:9600")]
    endpoint: String,

    #[command(subcommand)]
    operation: ShareOperation,
}

#[derive(Subcommand, Debug)]
enum ShareOperation {
    /// Create the export of a volume
    Create { volume: String },
    /// Delete the export of a volume and stop its share manager
    Delete { volume: String },
    /// Show the status of a volume's share
    Get { volume: String },
    /// List shares
    List,
    /// Stream share status changes
    Watch,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    match cli.command {
        Command::Daemon(args) => run_daemon(args).await,
        Command::Share(args) => run_share(args).await,
    }
}

async fn run_daemon(args: DaemonArgs) -> Result<()> {
    let volume = args.volume_descriptor();

    info!("Starting share manager");
    info!("  Volume: {}", volume.name);
    info!("  Encrypted: {}", volume.is_encrypted());
    info!("  Filesystem: {}", volume.fs_type);
    info!("  Data engine: {}", volume.data_engine);
    info!("  Fast failover: {}", volume.fast_failover);
    info!(
        "  NFS lease lifetime: {}s, grace period: {}s",
        volume.lease_lifetime, volume.grace_period
    );

    metrics::register();

    let lease = if volume.fast_failover {
        lease_coordinator(&args).await
    } else {
        None
    };

    let command = HostCommand::new().with_timeout(Duration::from_secs(args.command_timeout));
    let crypto_command = match &args.host_proc {
        Some(host_proc) => command.clone().with_host_namespaces(host_proc),
        None => command.clone(),
    };
    let mounter = SystemMounter::new(command)
        .with_probe_timeout(Duration::from_secs(args.probe_timeout));
    let daemon = GaneshaDaemon::new()
        .with_pid_file(&args.pid_file)
        .with_stop_timeout(Duration::from_secs(args.nfs_stop_timeout));

    let config = ManagerConfig {
        paths: VolumePaths {
            export_root: args.export_root.clone(),
            ..Default::default()
        },
        config_path: args.config_path.clone(),
        ..Default::default()
    };
    let deps = Dependencies {
        mounter: Arc::new(mounter),
        crypto: Arc::new(CryptsetupDevice::new(crypto_command)),
        daemon: Arc::new(daemon),
        lease,
    };

    let manager = ShareManager::new(volume, config, deps).map_err(|e| {
        error!("Failed to create share manager: {}", e);
        e
    })?;

    // Start control API
    let api_manager = manager.clone();
    let listen = args.listen.clone();
    let api_shutdown = manager.cancellation();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::run_server(&listen, api_manager, api_shutdown).await {
            error!("Control API error: {}", e);
        }
    });

    // Translate termination signals into a shutdown
    let signal_manager = manager.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received termination signal");
        signal_manager.shutdown();
    });

    let result = manager.clone().run().await;
    if let Err(e) = api_handle.await {
        warn!("Control API task failed: {}", e);
    }

    info!("Share manager shutdown complete");
    result
}

/// Build the lease coordinator. Failures leave it unset, which stops the
/// manager before it serves the volume.
async fn lease_coordinator(args: &DaemonArgs) -> Option<Arc<LeaseCoordinator>> {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create Kubernetes client: {}", e);
            return None;
        }
    };

    let pod_name = args.pod_name();
    let node = match pod_node_name(client.clone(), &args.pod_namespace, &pod_name).await {
        Ok(node) => node,
        Err(e) => {
            error!(pod = %pod_name, "Failed to look up the node of this pod: {}", e);
            return None;
        }
    };

    info!(node = %node, "Fast failover lease holder");
    let store = Arc::new(KubeLeaseStore::new(client, args.pod_namespace.clone()));
    Some(Arc::new(LeaseCoordinator::new(store, args.volume.clone(), node)))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// =============================================================================
// Share Client
// =============================================================================

async fn run_share(args: ShareArgs) -> Result<()> {
    let client = ShareClient::new(&args.endpoint)?;

    match args.operation {
        ShareOperation::Create { volume } => print_json(&client.create(&volume).await?),
        ShareOperation::Delete { volume } => print_json(&client.delete(&volume).await?),
        ShareOperation::Get { volume } => print_json(&client.get(&volume).await?),
        ShareOperation::List => print_json(&client.list().await?),
        ShareOperation::Watch => {
            client
                .watch(|status| match serde_json::to_string(&status) {
                    Ok(line) => {
                        println!("{}", line);
                        true
                    }
                    Err(e) => {
                        error!("Failed to encode status: {}", e);
                        false
                    }
                })
                .await
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Internal(format!("failed to encode output: {}", e)))?;
    println!("{}", out);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(format!("hyper=warn,kube=info,tower=warn,{}", env_directives));

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
