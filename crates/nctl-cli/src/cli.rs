use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "nctl",
    about = "Client-side state for a Docker-compatible containerd CLI",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Root directory for persistent client state
    #[arg(long, global = true)]
    pub data_root: Option<PathBuf>,

    /// containerd socket address
    #[arg(long, global = true)]
    pub address: Option<String>,

    /// containerd namespace
    #[arg(short = 'n', long, global = true)]
    pub namespace: Option<String>,

    /// Configuration file (default: $NCTL_TOML or /etc/nctl/nctl.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub debug: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Claim, release, and list container names
    Name(NameArgs),
    /// Manage volumes
    Volume(VolumeArgs),
    /// Manage container metadata
    Container(ContainerArgs),
    /// List or remove namespaces
    Namespace(NamespaceArgs),
    /// Show generated hosts files
    Hosts(HostsArgs),
    #[command(hide = true)]
    Debug(DebugArgs),
}

#[derive(Args)]
pub struct NameArgs {
    #[command(subcommand)]
    pub action: NameAction,
}

#[derive(Subcommand)]
pub enum NameAction {
    /// Claim NAME for container ID
    Acquire { name: String, id: String },
    /// Release NAME, optionally only if ID holds it
    Release {
        name: String,
        #[arg(long)]
        id: Option<String>,
    },
    /// Move ID's claim from OLD to NEW
    Rename { old: String, new: String, id: String },
    #[command(alias = "list")]
    Ls,
    Inspect { name: String },
}

#[derive(Args)]
pub struct VolumeArgs {
    #[command(subcommand)]
    pub action: VolumeAction,
}

#[derive(Subcommand)]
pub enum VolumeAction {
    /// Create a volume; anonymous when NAME is omitted
    Create {
        name: Option<String>,
        /// Label in KEY=VALUE form
        #[arg(long = "label")]
        labels: Vec<String>,
    },
    #[command(alias = "list")]
    Ls {
        /// Compute disk usage of each volume
        #[arg(long)]
        size: bool,
    },
    Inspect {
        #[arg(required = true)]
        names: Vec<String>,
        #[arg(long)]
        size: bool,
    },
    #[command(alias = "remove")]
    Rm {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Args)]
pub struct ContainerArgs {
    #[command(subcommand)]
    pub action: ContainerAction,
}

#[derive(Subcommand)]
pub enum ContainerAction {
    Create(CreateArgs),
    #[command(alias = "list")]
    Ls,
    Inspect { container: String },
    #[command(alias = "remove")]
    Rm {
        container: String,
        /// Also remove anonymous volumes
        #[arg(short = 'v', long)]
        volumes: bool,
    },
    Rename { container: String, new_name: String },
}

#[derive(Args)]
pub struct CreateArgs {
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long, default_value = "alpine:latest")]
    pub image: String,
    #[arg(long)]
    pub hostname: Option<String>,
    /// Named volume to mount
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,
    /// Number of anonymous volumes to provision
    #[arg(long, default_value = "0")]
    pub anon_volumes: usize,
    /// Network address in NET=IP form
    #[arg(long = "network")]
    pub networks: Vec<String>,
    /// Extra hosts entry in HOST:IP form
    #[arg(long = "add-host")]
    pub extra_hosts: Vec<String>,
    /// Label in KEY=VALUE form
    #[arg(long = "label")]
    pub labels: Vec<String>,
}

#[derive(Args)]
pub struct NamespaceArgs {
    #[command(subcommand)]
    pub action: NamespaceAction,
}

#[derive(Subcommand)]
pub enum NamespaceAction {
    #[command(alias = "list")]
    Ls,
    #[command(alias = "remove")]
    Rm {
        name: String,
        /// Remove even if the namespace still holds state
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
pub struct HostsArgs {
    #[command(subcommand)]
    pub action: HostsAction,
}

#[derive(Subcommand)]
pub enum HostsAction {
    Show { container: String },
}

#[derive(Args)]
pub struct DebugArgs {
    #[command(subcommand)]
    pub action: DebugAction,
}

#[derive(Subcommand)]
pub enum DebugAction {
    /// Lock a bucket of the current namespace and hold it
    HoldLock {
        kind: String,
        /// Release after this many milliseconds instead of waiting to be killed
        #[arg(long)]
        ms: Option<u64>,
    },
}
