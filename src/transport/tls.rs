//! Broker URL parsing and TLS materials.
//!
//! Accepted broker URLs:
//! - `host` or `host:port`, plain TCP unless TLS is forced
//! - `mqtt://` and `tcp://` for plain TCP, `mqtts://` and `ssl://` for TLS
//! - bracketed IPv6 hosts, e.g. `[::1]:1883`
//!
//! A missing port means 1883, or 8883 with TLS.

use anyhow::{anyhow, bail, ensure, Context, Result};
use rumqttc::Transport as NetworkTransport;
use std::fmt;
use std::path::Path;

const DEFAULT_TCP_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// URL scheme and whether it implies TLS.
const SCHEMES: [(&str, bool); 4] = [
    ("mqtt", false),
    ("tcp", false),
    ("mqtts", true),
    ("ssl", true),
];

/// Certificates for TLS brokers, read from PEM files.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// Trusted CA. Without it the bundled root store is used.
    pub ca: Option<Vec<u8>>,
    /// Certificate and private key for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca: Option<&Path>,
        client_cert: Option<&Path>,
        client_key: Option<&Path>,
    ) -> Result<Self> {
        let client_auth = match (client_cert, client_key) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((
                read_pem(cert, "client certificate")?,
                read_pem(key, "client key")?,
            )),
            (Some(_), None) => bail!("TLS client certificate given without key"),
            (None, Some(_)) => bail!("TLS client key given without certificate"),
        };
        let ca = ca.map(|path| read_pem(path, "CA")).transpose()?;
        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("cannot read TLS {} from '{}'", what, path.display()))
}

/// Where the broker lives and how to reach it.
#[derive(Clone, Debug)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub tls: TlsMaterials,
}

impl MqttEndpoint {
    pub(crate) fn network_transport(&self) -> Result<NetworkTransport> {
        match (self.use_tls, self.tls.is_configured()) {
            (false, false) => Ok(NetworkTransport::tcp()),
            (false, true) => Err(anyhow!(
                "TLS certificates configured but TLS is disabled for {}; use an mqtts:// broker URL",
                self
            )),
            (true, false) => Ok(NetworkTransport::tls_with_default_config()),
            (true, true) => {
                let ca = self
                    .tls
                    .ca
                    .clone()
                    .context("a CA certificate is required alongside a TLS client certificate")?;
                Ok(NetworkTransport::tls(ca, self.tls.client_auth.clone(), None))
            }
        }
    }
}

impl fmt::Display for MqttEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Parse a broker URL. TLS materials are left empty.
pub fn parse_mqtt_endpoint(url: &str, force_tls: bool) -> Result<MqttEndpoint> {
    let url = url.trim();
    let (use_tls, authority) = match url.split_once("://") {
        Some((scheme, rest)) => {
            let implies_tls = SCHEMES
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(scheme))
                .map(|(_, tls)| *tls)
                .ok_or_else(|| anyhow!("unsupported broker URL scheme '{}'", scheme))?;
            (implies_tls || force_tls, rest)
        }
        None => (force_tls, url),
    };

    let authority = authority.trim_end_matches('/');
    ensure!(!authority.is_empty(), "broker URL '{}' has no host", url);
    let default_port = if use_tls {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_TCP_PORT
    };
    let (host, port) = split_authority(authority, default_port)
        .with_context(|| format!("invalid broker URL '{}'", url))?;

    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
        tls: TlsMaterials::default(),
    })
}

fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let (host, port) = match authority.strip_prefix('[') {
        Some(bracketed) => {
            let (host, tail) = bracketed
                .split_once(']')
                .context("unterminated IPv6 literal")?;
            let port = match tail {
                "" => None,
                _ => Some(
                    tail.strip_prefix(':')
                        .with_context(|| format!("unexpected '{}' after IPv6 literal", tail))?,
                ),
            };
            (host, port)
        }
        None => match authority.split_once(':') {
            Some((_, rest)) if rest.contains(':') => {
                bail!("IPv6 hosts must be bracketed, e.g. [::1]:1883")
            }
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        },
    };

    ensure!(!host.is_empty(), "missing host");
    let port = match port {
        None => default_port,
        Some(raw) => match raw.parse::<u16>() {
            Ok(0) | Err(_) => bail!("invalid port '{}'", raw),
            Ok(port) => port,
        },
    };
    Ok((host.to_string(), port))
}
