//! Command-line arguments for the controller.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "lagoon-controller", about = "Central image synchronizer service")]
pub struct Args {
    /// Address the API and reporter endpoint listen on.
    #[arg(long, env = "LAGOON_LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    pub listen_addr: String,

    /// Seconds between status aggregation passes.
    #[arg(long, default_value_t = 5)]
    pub aggregate_interval_secs: u64,

    /// Log verbosity: 0=error, 1=warn, 2=info, 3=debug, 4=trace.
    #[arg(long, default_value_t = 2)]
    pub log_level: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["lagoon-controller"]);
        assert_eq!(args.listen_addr, "0.0.0.0:8443");
        assert_eq!(args.aggregate_interval_secs, 5);
        assert_eq!(args.log_level, 2);
    }
}
