use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "gridproxy-server")]
#[command(about = "Read-only query gateway over the grid's indexed data", long_about = None)]
pub struct Cli {
    /// Print the build version and exit.
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Optional `.toml` or `.json` file; flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub postgres_host: Option<String>,

    #[arg(long)]
    pub postgres_port: Option<u16>,

    #[arg(long)]
    pub postgres_db: Option<String>,

    #[arg(long)]
    pub postgres_user: Option<String>,

    #[arg(long, env = "POSTGRES_PASSWORD", hide_env_values = true)]
    pub postgres_password: Option<String>,

    /// Listen address, e.g. `:443` or `127.0.0.1:8080`.
    #[arg(long)]
    pub address: Option<String>,

    #[arg(long)]
    pub log_level: Option<String>,

    /// Serve without expecting a TLS certificate.
    #[arg(long)]
    pub no_cert: bool,

    /// Message-bus relay used to refresh node telemetry.
    #[arg(long, env = "RELAY_URL")]
    pub relay_url: Option<String>,

    #[arg(long, env = "BUS_TWIN_ID")]
    pub bus_twin_id: Option<u32>,

    /// Concurrent node telemetry fetches.
    #[arg(long)]
    pub workers: Option<usize>,
}

impl Cli {
    /// The config file (or defaults) with the command line applied on top.
    pub fn load_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut ServerConfig) {
        let pg = &mut config.postgres;
        override_with(&mut pg.host, &self.postgres_host);
        override_with(&mut pg.port, &self.postgres_port);
        override_with(&mut pg.db, &self.postgres_db);
        override_with(&mut pg.user, &self.postgres_user);
        override_with(&mut pg.password, &self.postgres_password);
        override_with(&mut config.address, &self.address);
        override_with(&mut config.log_level, &self.log_level);
        override_with(&mut config.bus_twin_id, &self.bus_twin_id);
        override_with(&mut config.refresher.workers, &self.workers);
        if self.relay_url.is_some() {
            config.relay_url = self.relay_url.clone();
        }
        config.no_cert |= self.no_cert;
    }
}

fn override_with<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *slot = value.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_without_flags() {
        let cli = Cli::try_parse_from(["gridproxy-server"]).unwrap();
        assert!(!cli.version);
        let config = cli.load_config().unwrap();
        assert_eq!(config.address, ":443");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "address = \":9000\"\n[postgres]\nhost = \"from-file\"\ndb = \"indexer\"\n"
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "gridproxy-server",
            "--config",
            file.path().to_str().unwrap(),
            "--postgres-host",
            "from-flag",
            "--postgres-port",
            "6543",
            "--no-cert",
            "--workers",
            "4",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.postgres.host, "from-flag");
        assert_eq!(config.postgres.port, 6543);
        assert_eq!(config.postgres.db, "indexer");
        assert_eq!(config.address, ":9000");
        assert!(config.no_cert);
        assert_eq!(config.refresher.workers, 4);
    }

    #[test]
    fn test_short_version_flag() {
        let cli = Cli::try_parse_from(["gridproxy-server", "-v"]).unwrap();
        assert!(cli.version);
    }

    #[test]
    fn test_rejects_bad_port() {
        assert!(Cli::try_parse_from(["gridproxy-server", "--postgres-port", "big"]).is_err());
    }
}
