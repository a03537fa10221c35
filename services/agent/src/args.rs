//! Command-line arguments for the agent.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "lagoon-agent", about = "Per-node image synchronizer agent")]
pub struct Args {
    /// Name of the node this agent manages. Required; normally injected via
    /// the downward API.
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Container runtime image service socket.
    #[arg(
        long,
        env = "LAGOON_RUNTIME_ADDR",
        default_value = "unix:///run/containerd/containerd.sock"
    )]
    pub runtime_addr: String,

    /// Controller endpoint for both the object store and the reporter.
    #[arg(
        long,
        env = "LAGOON_CONTROLLER_URL",
        default_value = "http://lagoon-controller:8443"
    )]
    pub controller_url: String,

    /// Seconds between inventory reports.
    #[arg(long, default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Seconds between ImageSync list polls.
    #[arg(long, default_value_t = 10)]
    pub resync_interval_secs: u64,

    /// Node-global bound on concurrent runtime pulls/deletes.
    #[arg(long, default_value_t = 4)]
    pub max_concurrent_pullers: usize,

    /// Number of reconcile workers.
    #[arg(long, default_value_t = 2)]
    pub max_concurrent_reconcilers: usize,

    /// Log verbosity: 0=error, 1=warn, 2=info, 3=debug, 4=trace.
    #[arg(long, default_value_t = 2)]
    pub log_level: u8,

    /// Directory holding a `ca.crt` bundle used to trust the controller.
    #[arg(long, env = "LAGOON_TLS_DIR")]
    pub tls_dir: Option<PathBuf>,

    /// Skip TLS certificate verification for the controller endpoint.
    #[arg(long, default_value_t = false)]
    pub insecure_skip_verify: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["lagoon-agent", "--node-name", "node1"]);
        assert_eq!(args.node_name, "node1");
        assert_eq!(args.poll_interval_secs, 5);
        assert_eq!(args.max_concurrent_pullers, 4);
        assert!(args.runtime_addr.starts_with("unix://"));
        assert!(!args.insecure_skip_verify);
    }
}
