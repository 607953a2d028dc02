use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use clap::ValueEnum;
use log::LevelFilter;
use serde::Deserialize;

use crate::error::Error;

/// An upstream BGP peer: peering address plus its AS number.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct Neighbor {
    pub address: Ipv4Addr,
    pub asn: u32,
}

/// Speaker configuration, immutable after load.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Advertised /32; doubles as the BGP router-id.
    pub anycast_ip: Ipv4Addr,
    /// Local AS number.
    pub asn: u32,
    /// Upstream peers. May be empty.
    #[serde(default)]
    pub neighbors: Vec<Neighbor>,
    /// Health probe target; absent (or empty) disables the advertisement gate.
    #[serde(default)]
    pub health_check_url: Option<String>,
    /// Kernel route metric; presence enables the FIB reconciler.
    #[serde(default)]
    pub update_fib_metric: Option<u32>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, Error> {
        let mut config: Config = serde_yaml::from_str(contents)?;
        // An explicit empty string means the same as leaving the key out.
        if config.health_check_url.as_deref() == Some("") {
            config.health_check_url = None;
        }
        Ok(config)
    }
}

/// Log verbosity accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Panic,
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        use LogLevel::*;
        match self {
            // The log crate has no panic/fatal levels; clamp to error.
            Panic | Fatal | Error => LevelFilter::Error,
            Warn => LevelFilter::Warn,
            Info => LevelFilter::Info,
            Debug => LevelFilter::Debug,
            Trace => LevelFilter::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use LogLevel::*;
        let word = match self {
            Panic => "panic",
            Fatal => "fatal",
            Error => "error",
            Warn => "warn",
            Info => "info",
            Debug => "debug",
            Trace => "trace",
        };
        write!(f, "{}", word)
    }
}
