use std::{
    env,
    fs::read_to_string,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
};

use anyhow::{Context, anyhow};
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Server {
    /// http and websocket listen port
    ///
    /// The browser signaling channel and the health surface share one
    /// listener; a fronting proxy is expected to terminate TLS.
    #[serde(default = "Server::port")]
    pub port: u16,

    /// whether the fronting listener serves wss/https
    ///
    /// Only reported on the health endpoint; the gateway itself always
    /// speaks plain ws/http and leaves certificates to the fronting
    /// listener.
    #[serde(default)]
    pub enable_ssl: bool,

    #[serde(default)]
    pub ssl_key_path: Option<String>,

    #[serde(default)]
    pub ssl_cert_path: Option<String>,
}

impl Server {
    fn port() -> u16 {
        8080
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            port: Self::port(),
            enable_ssl: false,
            ssl_key_path: None,
            ssl_cert_path: None,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Sip {
    /// whether the telephony leg is enabled
    ///
    /// With the gateway disabled the hub still relays browser to
    /// browser signaling, it just refuses telephony targets.
    #[serde(default = "Sip::enabled")]
    pub enabled: bool,

    /// upstream telephony server host
    #[serde(default = "Sip::server_host")]
    pub server_host: String,

    #[serde(default = "Sip::server_port")]
    pub server_port: u16,

    /// SIP domain written into the gateway's From identity
    #[serde(default = "Sip::domain")]
    pub domain: String,

    /// local UDP port the gateway answers SIP on
    #[serde(default = "Sip::local_port")]
    pub local_port: u16,

    /// address advertised in Via, Contact, Record-Route and Call-ID
    ///
    /// A literal IPv4 address, or "auto" to pick the first
    /// non-loopback interface at startup.
    #[serde(default = "Sip::public_ip")]
    pub public_ip: String,

    /// concurrent session cap
    ///
    /// INVITEs above the cap are refused with 503; outbound calls get
    /// a capacity error.
    #[serde(default = "Sip::max_sessions")]
    pub max_sessions: usize,
}

impl Sip {
    fn enabled() -> bool {
        true
    }

    fn server_host() -> String {
        "127.0.0.1".to_string()
    }

    fn server_port() -> u16 {
        5060
    }

    fn domain() -> String {
        "localhost".to_string()
    }

    fn local_port() -> u16 {
        5060
    }

    fn public_ip() -> String {
        "auto".to_string()
    }

    fn max_sessions() -> usize {
        50
    }
}

impl Default for Sip {
    fn default() -> Self {
        Self {
            enabled: Self::enabled(),
            server_host: Self::server_host(),
            server_port: Self::server_port(),
            domain: Self::domain(),
            local_port: Self::local_port(),
            public_ip: Self::public_ip(),
            max_sessions: Self::max_sessions(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Relay {
    /// media relay daemon host
    #[serde(default = "Relay::host")]
    pub host: String,

    #[serde(default = "Relay::port")]
    pub port: u16,
}

impl Relay {
    fn host() -> String {
        "127.0.0.1".to_string()
    }

    fn port() -> u16 {
        22222
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: Self::port(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }

    fn parse(value: &str) -> anyhow::Result<Self> {
        Ok(match value.to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            other => return Err(anyhow!("unknown log level: {}", other)),
        })
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the
    /// logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub sip: Sip,
    #[serde(default)]
    pub relay: Relay,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Loads the optional configuration file named on the command
    /// line, then applies the environment overrides. Environment wins
    /// over file, file wins over defaults.
    pub fn load() -> anyhow::Result<Self> {
        let text = Cli::parse()
            .config
            .map(read_to_string)
            .transpose()
            .context("read config file failed")?
            .unwrap_or_default();

        let mut config: Config = toml::from_str(&text).context("parse config file failed")?;
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(port) = env_parse::<u16>("PORT")? {
            self.server.port = port;
        }
        if let Some(enabled) = env_parse::<bool>("ENABLE_SSL")? {
            self.server.enable_ssl = enabled;
        }
        if let Ok(path) = env::var("SSL_KEY_PATH") {
            self.server.ssl_key_path = Some(path);
        }
        if let Ok(path) = env::var("SSL_CERT_PATH") {
            self.server.ssl_cert_path = Some(path);
        }
        if let Some(enabled) = env_parse::<bool>("ENABLE_SIP_GATEWAY")? {
            self.sip.enabled = enabled;
        }
        if let Ok(host) = env::var("SIP_SERVER_HOST") {
            self.sip.server_host = host;
        }
        if let Some(port) = env_parse::<u16>("SIP_SERVER_PORT")? {
            self.sip.server_port = port;
        }
        if let Ok(domain) = env::var("SIP_DOMAIN") {
            self.sip.domain = domain;
        }
        if let Some(port) = env_parse::<u16>("LOCAL_SIP_PORT")? {
            self.sip.local_port = port;
        }
        if let Ok(host) = env::var("RTPENGINE_HOST") {
            self.relay.host = host;
        }
        if let Some(port) = env_parse::<u16>("RTPENGINE_PORT")? {
            self.relay.port = port;
        }
        if let Ok(ip) = env::var("PUBLIC_IP") {
            self.sip.public_ip = ip;
        }
        if let Some(max) = env_parse::<usize>("MAX_SESSIONS")? {
            self.sip.max_sessions = max;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.log.level = LogLevel::parse(&level)?;
        }
        Ok(())
    }

    /// The address written into Contact, Via, Record-Route and
    /// Call-ID. `auto` resolves to the first non-loopback IPv4
    /// interface.
    pub fn advertised_ip(&self) -> anyhow::Result<String> {
        if self.sip.public_ip != "auto" {
            let ip: Ipv4Addr = self
                .sip
                .public_ip
                .parse()
                .context("PUBLIC_IP is not a literal IPv4 address")?;
            return Ok(ip.to_string());
        }

        for interface in get_if_addrs::get_if_addrs().context("interface discovery failed")? {
            if let get_if_addrs::IfAddr::V4(v4) = interface.addr {
                if !v4.ip.is_loopback() {
                    return Ok(v4.ip.to_string());
                }
            }
        }
        Err(anyhow!("no non-loopback IPv4 interface found"))
    }

    pub fn upstream_addr(&self) -> anyhow::Result<SocketAddr> {
        (self.sip.server_host.as_str(), self.sip.server_port)
            .to_socket_addrs()
            .context("resolve SIP server address failed")?
            .next()
            .ok_or(anyhow!("SIP server address resolves to nothing"))
    }

    pub fn relay_addr(&self) -> anyhow::Result<SocketAddr> {
        (self.relay.host.as_str(), self.relay.port)
            .to_socket_addrs()
            .context("resolve media relay address failed")?
            .next()
            .ok_or(anyhow!("media relay address resolves to nothing"))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("invalid value for {}: {}", name, value)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.sip.enabled);
        assert_eq!(config.sip.server_port, 5060);
        assert_eq!(config.sip.public_ip, "auto");
        assert_eq!(config.sip.max_sessions, 50);
        assert_eq!(config.relay.port, 22222);
    }

    #[test]
    fn file_values_override_defaults() {
        let config: Config = toml::from_str(
            "[sip]\nserver_host = \"10.0.0.2\"\nmax_sessions = 5\n\n[relay]\nport = 2223\n",
        )
        .unwrap();
        assert_eq!(config.sip.server_host, "10.0.0.2");
        assert_eq!(config.sip.max_sessions, 5);
        assert_eq!(config.relay.port, 2223);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn literal_public_ip_is_validated() {
        let mut config = Config::default();
        config.sip.public_ip = "192.168.1.5".to_string();
        assert_eq!(config.advertised_ip().unwrap(), "192.168.1.5");

        config.sip.public_ip = "not-an-ip".to_string();
        assert!(config.advertised_ip().is_err());
    }
}
