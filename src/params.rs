// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.


//! Configuration and parameters for bytestream sessions.
use std::convert::TryFrom;
use std::fmt::Display;
use std::fmt::Formatter;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;

use constellation_common::net::IPEndpoint;
use constellation_common::net::IPEndpointAddr;
use serde::Deserialize;
use serde::Serialize;

/// Default port on which to listen for inbound bytestreams.
pub const DEFAULT_PORT: u16 = 28915;
/// Default time a session may wait for activation, in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 60_000;
/// Default time a connection may spend negotiating, in milliseconds.
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 30_000;

/// Enum for SOCKS5 commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SOCKS5Command {
    /// TCP connect command.
    Connect = 0x01,
    /// TCP bind command.
    Bind = 0x02,
    /// UDP associate command.
    Associate = 0x03
}

/// Configuration for a mediating bytestream proxy.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProxyConfig {
    /// Identity of the proxy on the signaling layer.
    jid: String,
    /// Host name or address of the proxy.
    host: String,
    /// Port of the proxy.
    port: u16
}

/// Configuration for the bytestream manager.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BytestreamConfig {
    /// Local address on which to listen.
    #[serde(default = "BytestreamConfig::default_listen_ip")]
    listen_ip: IpAddr,
    /// Local port on which to listen.
    #[serde(default = "BytestreamConfig::default_port")]
    port: u16,
    /// Host to advertise in our streamhost offer.
    ///
    /// If this is not set, the bound listen address is used.
    #[serde(default)]
    host: Option<String>,
    /// Optional mediating proxy.
    #[serde(default)]
    proxy: Option<ProxyConfig>,
    /// Milliseconds a session may wait to be activated.
    #[serde(default = "BytestreamConfig::default_session_timeout_ms")]
    session_timeout_ms: u64,
    /// Milliseconds a connection may spend in SOCKS5 negotiation.
    #[serde(default = "BytestreamConfig::default_negotiation_timeout_ms")]
    negotiation_timeout_ms: u64
}

/// A candidate location at which a bytestream can be established.
///
/// This may be the offering party itself or a mediating proxy.
#[derive(Clone, Debug, PartialEq)]
pub struct Streamhost {
    /// Identity of the streamhost.
    jid: String,
    /// Network endpoint of the streamhost.
    endpoint: IPEndpoint
}

impl SOCKS5Command {
    /// Get the command for a protocol code, if there is one.
    #[inline]
    pub fn from_code(code: u8) -> Option<SOCKS5Command> {
        match code {
            0x01 => Some(SOCKS5Command::Connect),
            0x02 => Some(SOCKS5Command::Bind),
            0x03 => Some(SOCKS5Command::Associate),
            _ => None
        }
    }
}

impl ProxyConfig {
    /// Create a new `ProxyConfig`.
    #[inline]
    pub fn new(
        jid: String,
        host: String,
        port: u16
    ) -> ProxyConfig {
        ProxyConfig {
            jid: jid,
            host: host,
            port: port
        }
    }

    /// Get the proxy identity.
    #[inline]
    pub fn jid(&self) -> &str {
        &self.jid
    }

    /// Get the proxy host.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the proxy port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the proxy as a streamhost candidate.
    #[inline]
    pub fn streamhost(&self) -> Streamhost {
        Streamhost::new(self.jid.clone(), &self.host, self.port)
    }
}

impl Default for BytestreamConfig {
    #[inline]
    fn default() -> Self {
        BytestreamConfig {
            listen_ip: BytestreamConfig::default_listen_ip(),
            port: BytestreamConfig::default_port(),
            host: None,
            proxy: None,
            session_timeout_ms: BytestreamConfig::default_session_timeout_ms(),
            negotiation_timeout_ms:
                BytestreamConfig::default_negotiation_timeout_ms()
        }
    }
}

impl BytestreamConfig {
    #[inline]
    fn default_listen_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    #[inline]
    fn default_port() -> u16 {
        DEFAULT_PORT
    }

    #[inline]
    fn default_session_timeout_ms() -> u64 {
        DEFAULT_SESSION_TIMEOUT_MS
    }

    #[inline]
    fn default_negotiation_timeout_ms() -> u64 {
        DEFAULT_NEGOTIATION_TIMEOUT_MS
    }

    /// Create a configuration listening on `listen_ip` and `port`,
    /// with defaults for everything else.
    #[inline]
    pub fn new(
        listen_ip: IpAddr,
        port: u16
    ) -> BytestreamConfig {
        BytestreamConfig {
            listen_ip: listen_ip,
            port: port,
            ..BytestreamConfig::default()
        }
    }

    /// Set the host to advertise in streamhost offers.
    #[inline]
    pub fn with_host(
        mut self,
        host: String
    ) -> BytestreamConfig {
        self.host = Some(host);
        self
    }

    /// Set the mediating proxy.
    #[inline]
    pub fn with_proxy(
        mut self,
        proxy: ProxyConfig
    ) -> BytestreamConfig {
        self.proxy = Some(proxy);
        self
    }

    /// Set the session activation timeout.
    ///
    /// The timeout is kept to millisecond precision.
    #[inline]
    pub fn with_session_timeout(
        mut self,
        timeout: Duration
    ) -> BytestreamConfig {
        self.session_timeout_ms = millis(timeout);
        self
    }

    /// Set the SOCKS5 negotiation timeout.
    ///
    /// The timeout is kept to millisecond precision.
    #[inline]
    pub fn with_negotiation_timeout(
        mut self,
        timeout: Duration
    ) -> BytestreamConfig {
        self.negotiation_timeout_ms = millis(timeout);
        self
    }

    /// Get the address on which to listen.
    #[inline]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.port)
    }

    /// Get the configured advertised host, if any.
    #[inline]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Get the mediating proxy configuration, if any.
    #[inline]
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Get the session activation timeout.
    #[inline]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Get the SOCKS5 negotiation timeout.
    #[inline]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

/// Whole milliseconds in `timeout`, saturating.
#[inline]
fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

impl Streamhost {
    /// Create a streamhost from an identity, host and port.
    ///
    /// `host` is treated as an IP address if it parses as one, and
    /// as a DNS name otherwise.
    pub fn new(
        jid: String,
        host: &str,
        port: u16
    ) -> Streamhost {
        let addr = match host.parse::<IpAddr>() {
            Ok(ip) => IPEndpointAddr::ip(ip),
            Err(_) => IPEndpointAddr::name(String::from(host))
        };

        Streamhost {
            jid: jid,
            endpoint: IPEndpoint::new(addr, port)
        }
    }

    /// Get the streamhost identity.
    #[inline]
    pub fn jid(&self) -> &str {
        &self.jid
    }

    /// Get the streamhost network endpoint.
    #[inline]
    pub fn endpoint(&self) -> &IPEndpoint {
        &self.endpoint
    }
}

impl Display for SOCKS5Command {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            SOCKS5Command::Connect => write!(f, "connect"),
            SOCKS5Command::Bind => write!(f, "bind"),
            SOCKS5Command::Associate => write!(f, "UDP associate")
        }
    }
}

impl Display for Streamhost {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{} ({})", self.jid, self.endpoint)
    }
}

#[test]
fn test_config_defaults() {
    let config: BytestreamConfig =
        serde_json::from_str("{}").expect("Expected success");

    assert_eq!(config, BytestreamConfig::default());
    assert_eq!(
        config.listen_addr(),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT)
    );
    assert_eq!(config.session_timeout(), Duration::from_secs(60));
    assert!(config.proxy().is_none());
}

#[test]
fn test_config_with_proxy() {
    let json = r#"{
        "listen-ip": "127.0.0.1",
        "port": 7777,
        "host": "files.example.com",
        "proxy": {
            "jid": "proxy.example.com",
            "host": "10.0.0.1",
            "port": 7625
        },
        "session-timeout-ms": 5000
    }"#;
    let config: BytestreamConfig =
        serde_json::from_str(json).expect("Expected success");
    let proxy = config.proxy().expect("Expected proxy");

    assert_eq!(config.port, 7777);
    assert_eq!(config.host(), Some("files.example.com"));
    assert_eq!(config.session_timeout(), Duration::from_secs(5));
    assert_eq!(
        config.negotiation_timeout(),
        Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS)
    );
    assert_eq!(proxy.jid(), "proxy.example.com");
    assert_eq!(
        proxy.streamhost().endpoint(),
        &IPEndpoint::new(
            IPEndpointAddr::ip(IpAddr::from([10, 0, 0, 1])),
            7625
        )
    );
}

#[test]
fn test_config_subsecond_timeouts() {
    let config = BytestreamConfig::default()
        .with_session_timeout(Duration::from_millis(250))
        .with_negotiation_timeout(Duration::from_micros(1500));

    assert_eq!(config.session_timeout(), Duration::from_millis(250));
    assert_eq!(config.negotiation_timeout(), Duration::from_millis(1));

    let json = serde_json::to_value(&config).expect("Expected success");

    assert_eq!(json["session-timeout-ms"], 250);
}

#[test]
fn test_streamhost_name() {
    let streamhost =
        Streamhost::new(String::from("proxy.example.com"), "proxy", 7625);

    assert_eq!(
        streamhost.endpoint(),
        &IPEndpoint::new(IPEndpointAddr::name(String::from("proxy")), 7625)
    );
}

#[test]
fn test_command_from_code() {
    assert_eq!(SOCKS5Command::from_code(0x01), Some(SOCKS5Command::Connect));
    assert_eq!(SOCKS5Command::from_code(0x02), Some(SOCKS5Command::Bind));
    assert_eq!(SOCKS5Command::from_code(0x09), None);
}
