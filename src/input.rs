//! Provides a means to read, parse and hold configuration options for runs.
use clap::Parser;
use serde_derive::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::scanner::{Settings, DEFAULT_MAX_CONCURRENT_PROBES, DEFAULT_PORT, DEFAULT_TIMEOUT_MS};

/// Rows of the latency summary printed by default.
pub const DEFAULT_TOP: usize = 100;
const CONFIG_FILE_NAME: &str = ".cidrprobe.toml";

/// Problems turning options, files and config into a run.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("could not read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("found {0} in configuration file")]
    Config(#[from] toml::de::Error),
    #[error("no CIDR blocks to probe; pass --addresses or --file")]
    NoTargets,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "cidrprobe",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Probes every address of one or more CIDR blocks for TCP reachability and
/// reports the latency of each reachable host.
/// WARNING Wide blocks open a great many connections at once; do not point
/// this at infrastructure you are not allowed to test.
pub struct Opts {
    /// A comma-delimited list of CIDR blocks or single addresses to probe.
    #[arg(short, long, value_delimiter = ',')]
    pub addresses: Vec<String>,

    /// Files with one CIDR block per line. Blank lines and lines starting
    /// with '#' are skipped.
    #[arg(short, long)]
    pub file: Vec<PathBuf>,

    /// The TCP port probed on every address. [default: 80]
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// The timeout in milliseconds before an address is counted as
    /// unreachable. Capped at 2000. [default: 1000]
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Most probes in flight at once. Lowered automatically when the open
    /// file limit is too small. [default: 1000]
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// OS threads driving the probes. [default: number of CPUs]
    #[arg(long)]
    pub threads: Option<usize>,

    /// Log every probe, not only start, stop and cleanup.
    #[arg(short, long)]
    pub verbose: bool,

    /// Greppable mode. Only output reachable addresses, one per line.
    #[arg(short, long)]
    pub greppable: bool,

    /// Accessible mode. Turns off features which negatively affect screen readers.
    #[arg(long)]
    pub accessible: bool,

    /// Print every result as one JSON object per line.
    #[arg(long, conflicts_with = "greppable")]
    pub json: bool,

    /// Save reachable addresses, fastest first, to this file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Rows of the latency summary printed at the end. [default: 100]
    #[arg(long)]
    pub top: Option<usize>,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(long, value_parser)]
    pub config_path: Option<PathBuf>,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    pub fn read() -> Self {
        Self::parse()
    }

    /// Fills in whatever the command line left unset from the user
    /// configuration file. Flags given on the command line always win.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(true) = config.$field {
                        self.$field = true;
                    }
                )+
            }
        }

        if self.addresses.is_empty() && self.file.is_empty() {
            if let Some(addresses) = &config.addresses {
                self.addresses.clone_from(addresses);
            }
        }

        merge_required!(verbose, greppable, accessible, json);
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if self.$field.is_none() {
                        self.$field = config.$field;
                    }
                )+
            }
        }

        merge_optional!(port, timeout, concurrency, threads, top, ulimit);
    }

    /// The settings record for the scanner, defaults filled in.
    pub fn settings(&self) -> Settings {
        Settings {
            reactor_threads: self.threads.unwrap_or(0),
            timeout_ms: self.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            max_concurrent_probes: self.concurrency.unwrap_or(DEFAULT_MAX_CONCURRENT_PROBES),
            port: self.port.unwrap_or(DEFAULT_PORT),
            verbose_logging: self.verbose,
        }
        .normalized()
    }

    /// Whether stdout is reserved for machine-readable output.
    pub const fn quiet(&self) -> bool {
        self.greppable || self.json
    }

    pub fn top(&self) -> usize {
        self.top.unwrap_or(DEFAULT_TOP)
    }

    /// Every CIDR entry from `--addresses` and `--file`, in order.
    pub fn targets(&self) -> Result<Vec<String>, InputError> {
        let mut targets: Vec<String> = self
            .addresses
            .iter()
            .flat_map(|entry| cidr_lines(entry))
            .map(str::to_owned)
            .collect();
        for path in &self.file {
            targets.extend(read_cidr_file(path)?);
        }

        if targets.is_empty() {
            return Err(InputError::NoTargets);
        }
        Ok(targets)
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[cfg(not(tarpaulin_include))]
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    addresses: Option<Vec<String>>,
    port: Option<u16>,
    timeout: Option<u64>,
    concurrency: Option<usize>,
    threads: Option<usize>,
    verbose: Option<bool>,
    greppable: Option<bool>,
    accessible: Option<bool>,
    json: Option<bool>,
    top: Option<usize>,
    ulimit: Option<u64>,
}

#[cfg(not(tarpaulin_include))]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing file is an empty config.
    ///
    /// # Format
    ///
    /// addresses = ["10.0.0.0/24", "2001:db8::/120"]
    /// port = 443
    /// timeout = 800
    /// concurrency = 500
    /// greppable = true
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> Result<Self, InputError> {
        let Some(config_path) = custom_config_path.or_else(default_config_path) else {
            return Ok(Self::default());
        };
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).map_err(|source| InputError::Read {
            path: config_path,
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, InputError> {
        Ok(toml::from_str(content)?)
    }
}

/// Constructs default path to config toml, if there is a home directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
}

/// The CIDR entries of a block of text: lines trimmed, blank lines and
/// `#` comments dropped.
pub fn cidr_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Reads a file of CIDR entries, one per line.
pub fn read_cidr_file(path: &Path) -> Result<Vec<String>, InputError> {
    let content = fs::read_to_string(path).map_err(|source| InputError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(cidr_lines(&content).map(str::to_owned).collect())
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use parameterized::parameterized;
    use std::fs;

    use super::{cidr_lines, read_cidr_file, Config, InputError, Opts};

    impl Config {
        fn sample() -> Self {
            Self {
                addresses: Some(vec!["10.0.0.0/24".to_owned()]),
                port: Some(443),
                timeout: Some(800),
                concurrency: Some(250),
                threads: None,
                verbose: Some(true),
                greppable: Some(true),
                accessible: None,
                json: None,
                top: Some(10),
                ulimit: Some(5_000),
            }
        }
    }

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[parameterized(input = {
        vec!["cidrprobe", "--addresses", "10.0.0.0/30"],
        vec!["cidrprobe", "-a", "10.0.0.0/30,2001:db8::/126"],
        vec!["cidrprobe", "-p", "443", "-t", "500", "-a", "10.0.0.1"],
    }, addresses = {
        vec!["10.0.0.0/30"],
        vec!["10.0.0.0/30", "2001:db8::/126"],
        vec!["10.0.0.1"],
    })]
    fn parse_addresses(input: Vec<&str>, addresses: Vec<&str>) {
        let opts = Opts::parse_from(input);
        assert_eq!(opts.addresses, addresses);
    }

    #[test]
    fn port_zero_is_rejected() {
        assert!(Opts::try_parse_from(["cidrprobe", "-a", "10.0.0.1", "-p", "0"]).is_err());
    }

    #[test]
    fn json_conflicts_with_greppable() {
        assert!(Opts::try_parse_from(["cidrprobe", "-a", "10.0.0.1", "-g", "--json"]).is_err());
    }

    #[test]
    fn opts_no_merge_when_config_is_ignored() {
        let mut opts = Opts {
            no_config: true,
            ..Opts::default()
        };
        opts.merge(&Config::sample());

        assert!(opts.addresses.is_empty());
        assert!(!opts.greppable);
        assert_eq!(opts.port, None);
        assert_eq!(opts.settings().port, 80);
    }

    #[test]
    fn opts_merge_required_arguments() {
        let mut opts = Opts::default();
        let config = Config::sample();

        opts.merge_required(&config);

        assert_eq!(opts.addresses, config.addresses.unwrap());
        assert!(opts.greppable);
        assert!(opts.verbose);
        assert!(!opts.accessible);
    }

    #[test]
    fn command_line_addresses_are_not_replaced() {
        let mut opts = Opts::parse_from(["cidrprobe", "-a", "192.168.0.0/30"]);
        opts.merge(&Config::sample());
        assert_eq!(opts.addresses, ["192.168.0.0/30"]);
    }

    #[test]
    fn opts_merge_optional_arguments() {
        let mut opts = Opts::parse_from(["cidrprobe", "-a", "10.0.0.1", "-p", "22"]);
        opts.merge_optional(&Config::sample());

        assert_eq!(opts.port, Some(22));
        assert_eq!(opts.timeout, Some(800));
        assert_eq!(opts.concurrency, Some(250));
        assert_eq!(opts.ulimit, Some(5_000));
        assert_eq!(opts.top(), 10);
    }

    #[test]
    fn settings_are_normalized() {
        let opts = Opts::parse_from(["cidrprobe", "-a", "10.0.0.1", "-t", "9000", "-c", "0"]);
        let settings = opts.settings();
        assert_eq!(settings.timeout_ms, 2_000);
        assert_eq!(settings.max_concurrent_probes, 1_000);
        assert!(settings.reactor_threads >= 1);
    }

    #[test]
    fn config_parses_from_toml() {
        let config = Config::parse("port = 8080\naddresses = [\"10.0.0.0/8\"]\njson = true\n").unwrap();
        assert_eq!(config.port, Some(8080));
        assert_eq!(config.json, Some(true));
        assert_eq!(config.addresses, Some(vec!["10.0.0.0/8".to_owned()]));
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(matches!(
            Config::parse("port = \"eighty\""),
            Err(InputError::Config(_))
        ));
    }

    #[parameterized(text = {
        "10.0.0.0/24",
        "  10.0.0.0/24  \n\n",
        "# office\n10.0.0.0/24\n   # disabled\n",
        "\r\n10.0.0.0/24\r\n",
    })]
    fn comments_and_blanks_are_dropped(text: &str) {
        assert_eq!(cidr_lines(text).collect::<Vec<_>>(), ["10.0.0.0/24"]);
    }

    #[test]
    fn targets_combine_addresses_and_files() {
        let path = std::env::temp_dir().join(format!("cidrprobe-targets-{}.txt", std::process::id()));
        fs::write(&path, "# lab\n192.168.1.0/30\n\n2001:db8::/126\n").unwrap();

        let opts = Opts {
            addresses: vec!["10.0.0.1".to_owned()],
            file: vec![path.clone()],
            ..Opts::default()
        };
        let targets = opts.targets().unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(targets, ["10.0.0.1", "192.168.1.0/30", "2001:db8::/126"]);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = read_cidr_file(std::path::Path::new("/nonexistent/cidrprobe.txt")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cidrprobe.txt"));
    }

    #[test]
    fn no_targets_is_an_error() {
        let opts = Opts {
            addresses: vec!["# nothing".to_owned()],
            ..Opts::default()
        };
        assert!(matches!(opts.targets(), Err(InputError::NoTargets)));
    }
}
