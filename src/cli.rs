use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "netpolicy-controller")]
#[command(about = "Kubernetes-native network policy controller")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Run the controller's observe/reconcile lifecycle
    Run,

    /// Promote newly observed edges into the frozen edge set
    Promote,
}
