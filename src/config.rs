//! Runtime configuration.
//!
//! Everything here is fixed at startup: the listen address, how many workers
//! each stage pool gets, how many readiness events one reactor wait may
//! return, and the per-connection buffer cap. The shard count is a separate
//! compile-time constant ([`crate::storage::NUM_SHARDS`]) because changing
//! it remaps every key.

use crate::server::conn::DEFAULT_BUFFER_CAP;
use crate::server::reactor::DEFAULT_MAX_EVENTS;

/// Server configuration, parsed from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Workers in each of the read, execute, and write pools.
    pub workers_per_stage: usize,
    /// Readiness events handled per reactor wakeup.
    pub max_events: usize,
    /// Ceiling on a connection's input or output buffer, in bytes.
    pub buffer_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            workers_per_stage: 8,
            max_events: DEFAULT_MAX_EVENTS,
            buffer_cap: DEFAULT_BUFFER_CAP,
        }
    }
}

impl Config {
    /// Parses configuration from command-line arguments, exiting on bad
    /// input or `--help`/`--version`.
    pub fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = take_value(&args, i, "--host");
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = parse_value(&args, i, "--port");
                    i += 2;
                }
                "--workers" | "-w" => {
                    config.workers_per_stage = parse_value(&args, i, "--workers");
                    if config.workers_per_stage == 0 {
                        eprintln!("Error: --workers must be at least 1");
                        std::process::exit(1);
                    }
                    i += 2;
                }
                "--max-events" => {
                    config.max_events = parse_value(&args, i, "--max-events");
                    if config.max_events == 0 {
                        eprintln!("Error: --max-events must be at least 1");
                        std::process::exit(1);
                    }
                    i += 2;
                }
                "--buffer-cap" => {
                    config.buffer_cap = parse_value(&args, i, "--buffer-cap");
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("relaykv version {}", crate::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// The bind address as `host:port`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn take_value(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {flag} requires a value");
            std::process::exit(1);
        }
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
    take_value(args, i, flag).parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {flag}");
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"relaykv - in-memory RESP key-value server

USAGE:
    relaykv [OPTIONS]

OPTIONS:
    -h, --host <HOST>          Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>          Port to listen on (default: 6379)
    -w, --workers <N>          Workers per pipeline stage (default: 8)
        --max-events <N>       Readiness events per reactor wakeup (default: 10)
        --buffer-cap <BYTES>   Per-connection buffer cap (default: 16 MiB)
    -v, --version              Print version information
        --help                 Print this help message

CONNECTING:
    Any RESP client works:
    $ redis-cli -p 6379
    127.0.0.1:6379> SET name value
    OK
    127.0.0.1:6379> GET name
    "value"
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 6379);
        assert_eq!(config.workers_per_stage, 8);
        assert_eq!(config.max_events, 10);
        assert_eq!(config.buffer_cap, 16 * 1024 * 1024);
    }

    #[test]
    fn bind_address_joins_host_and_port() {
        let config = Config {
            host: "0.0.0.0".to_string(),
            port: 7000,
            ..Config::default()
        };
        assert_eq!(config.bind_address(), "0.0.0.0:7000");
    }
}
