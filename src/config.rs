//! User agent configuration, applied once before any socket is opened.
use crate::{
    dialog::authenticate::Credential,
    media::{Codec, SrtpPolicy},
    transaction::endpoint::EndpointOption,
    transport::{SipAddr, TlsConfig, TransportKind},
    Error, Result,
};
use serde::Deserialize;
use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

const DEFAULT_MEDIA_PORT: u16 = 20000;

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_codecs() -> Vec<Codec> {
    vec![Codec::pcmu(), Codec::pcma(), Codec::g722()]
}

/// One listening transport.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
    #[serde(default = "default_bind_address")]
    pub address: IpAddr,
    /// 0 lets the OS pick a port.
    #[serde(default)]
    pub port: u16,
    /// Address advertised in Via and Contact when behind NAT.
    #[serde(default)]
    pub external: Option<SocketAddr>,
}

impl TransportConfig {
    pub fn new(kind: TransportKind, address: IpAddr, port: u16) -> Self {
        TransportConfig {
            kind,
            address,
            port,
            external: None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// PEM files for TLS. Without `cert_file` and `key_file` TLS is client-only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsFiles {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

impl TlsFiles {
    pub fn load(&self) -> Result<TlsConfig> {
        let read = |path: &Option<PathBuf>| -> Result<Option<Vec<u8>>> {
            match path {
                Some(path) => std::fs::read(path).map(Some).map_err(|e| {
                    Error::TlsError(format!("failed to read {}: {}", path.display(), e))
                }),
                None => Ok(None),
            }
        };
        Ok(TlsConfig {
            cert: read(&self.cert_file)?,
            key: read(&self.key_file)?,
            ca_certs: read(&self.ca_file)?,
            verifier: None,
        })
    }
}

/// Registrar binding and the bounded retry policy for refreshes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub server: String,
    pub expires: u32,
    /// Failed retries, after the first failed attempt, before giving up.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        RegistrationConfig {
            server: String::new(),
            expires: 3600,
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RegistrationConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay before retry number `attempt` (starting at 0), doubling and
    /// capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff()
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff())
    }

    pub fn server_uri(&self) -> Result<rsip::Uri> {
        rsip::Uri::try_from(self.server.as_str())
            .map_err(|e| Error::ConfigError(format!("bad registrar {}: {}", self.server, e)))
    }
}

/// RFC 3261 timer values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub max_retransmits: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        let option = EndpointOption::default();
        TimerConfig {
            t1_ms: option.t1.as_millis() as u64,
            t2_ms: option.t2.as_millis() as u64,
            t4_ms: option.t4.as_millis() as u64,
            max_retransmits: option.max_retransmits,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Address put in SDP. Defaults to the first transport's address.
    pub address: Option<IpAddr>,
    pub port: u16,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            address: None,
            port: DEFAULT_MEDIA_PORT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Address of record, `sip:` or `sips:`.
    pub identity: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub transports: Vec<TransportConfig>,
    #[serde(default)]
    pub srtp: SrtpPolicy,
    #[serde(default = "default_codecs")]
    pub codecs: Vec<Codec>,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub registration: Option<RegistrationConfig>,
    #[serde(default)]
    pub outbound_proxy: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsFiles>,
    #[serde(default)]
    pub timers: TimerConfig,
}

impl UserAgentConfig {
    pub fn new(identity: &str, transports: Vec<TransportConfig>) -> Self {
        UserAgentConfig {
            identity: identity.to_string(),
            display_name: None,
            user_agent: None,
            transports,
            srtp: SrtpPolicy::default(),
            codecs: default_codecs(),
            media: MediaConfig::default(),
            credential: None,
            registration: None,
            outbound_proxy: None,
            tls: None,
            timers: TimerConfig::default(),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: UserAgentConfig =
            toml::from_str(content).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.identity_uri()?;

        if self.transports.is_empty() {
            return Err(Error::ConfigError("no transport configured".to_string()));
        }
        let mut seen = HashSet::new();
        for transport in &self.transports {
            // port 0 binds a fresh ephemeral port each time
            if transport.port != 0 && !seen.insert((transport.kind, transport.port)) {
                return Err(Error::ConfigError(format!(
                    "duplicate transport {} port {}",
                    transport.kind, transport.port
                )));
            }
        }

        if self.codecs.is_empty() {
            return Err(Error::ConfigError(match self.srtp {
                SrtpPolicy::Mandatory => "mandatory srtp with no codec".to_string(),
                _ => "no codec configured".to_string(),
            }));
        }

        if let Some(registration) = &self.registration {
            registration.server_uri()?;
            if registration.initial_backoff_ms == 0 {
                return Err(Error::ConfigError(
                    "registration backoff must be positive".to_string(),
                ));
            }
            if registration.max_backoff_ms < registration.initial_backoff_ms {
                return Err(Error::ConfigError(format!(
                    "registration max backoff {}ms below initial {}ms",
                    registration.max_backoff_ms, registration.initial_backoff_ms
                )));
            }
        }

        let timers = &self.timers;
        if timers.max_retransmits == 0 {
            return Err(Error::ConfigError("max_retransmits must be positive".to_string()));
        }
        if timers.t1_ms == 0 || timers.t2_ms < timers.t1_ms {
            return Err(Error::ConfigError(format!(
                "invalid timers t1={}ms t2={}ms",
                timers.t1_ms, timers.t2_ms
            )));
        }

        self.outbound_proxy()?;
        Ok(())
    }

    pub fn identity_uri(&self) -> Result<rsip::Uri> {
        let uri = rsip::Uri::try_from(self.identity.as_str())
            .map_err(|e| Error::ConfigError(format!("bad identity {}: {}", self.identity, e)))?;
        match uri.scheme {
            Some(rsip::Scheme::Sip) | Some(rsip::Scheme::Sips) => Ok(uri),
            _ => Err(Error::ConfigError(format!(
                "identity {} is not a sip or sips uri",
                self.identity
            ))),
        }
    }

    pub fn outbound_proxy(&self) -> Result<Option<SipAddr>> {
        match &self.outbound_proxy {
            Some(proxy) => {
                let uri = rsip::Uri::try_from(proxy.as_str())
                    .map_err(|e| Error::ConfigError(format!("bad outbound proxy {}: {}", proxy, e)))?;
                SipAddr::try_from(&uri).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn resolved_user_agent(&self) -> String {
        self.user_agent
            .as_ref()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
            .unwrap_or_else(|| crate::VERSION.to_string())
    }

    pub fn endpoint_option(&self) -> EndpointOption {
        EndpointOption {
            t1: Duration::from_millis(self.timers.t1_ms),
            t2: Duration::from_millis(self.timers.t2_ms),
            t4: Duration::from_millis(self.timers.t4_ms),
            max_retransmits: self.timers.max_retransmits,
            ..Default::default()
        }
    }

    /// Where SDP says media should be sent.
    pub fn media_addr(&self) -> SocketAddr {
        let ip = self
            .media
            .address
            .or_else(|| {
                self.transports
                    .iter()
                    .map(|t| t.address)
                    .find(|ip| !ip.is_unspecified())
            })
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::new(ip, self.media.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
identity = "sip:alice@example.com"
srtp = "mandatory"

[[transports]]
kind = "udp"
port = 5060

[[transports]]
kind = "tls"
port = 5061

[[codecs]]
payload_type = 8
name = "PCMA"
clock_rate = 8000

[credential]
username = "alice"
password = "secret"

[registration]
server = "sip:registrar.example.com"
max_retries = 5

[timers]
t1_ms = 250
"#;

    fn udp(port: u16) -> TransportConfig {
        TransportConfig::new(TransportKind::Udp, IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_parse_toml() -> Result<()> {
        let config = UserAgentConfig::from_toml_str(SAMPLE)?;
        assert_eq!(config.srtp, SrtpPolicy::Mandatory);
        assert_eq!(config.transports.len(), 2);
        assert_eq!(config.transports[1].kind, TransportKind::Tls);
        assert!(config.transports[0].address.is_unspecified());
        assert_eq!(config.codecs, vec![Codec::pcma()]);

        let registration = config.registration.as_ref().expect("registration");
        assert_eq!(registration.max_retries, 5);
        assert_eq!(registration.expires, 3600);
        assert_eq!(registration.initial_backoff(), Duration::from_secs(1));

        let option = config.endpoint_option();
        assert_eq!(option.t1, Duration::from_millis(250));
        assert_eq!(option.t2, Duration::from_secs(4));
        assert_eq!(config.resolved_user_agent(), crate::VERSION);
        assert_eq!(config.media_addr().to_string(), "127.0.0.1:20000");
        Ok(())
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let registration = RegistrationConfig {
            server: "sip:registrar.example.com".to_string(),
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
            ..Default::default()
        };
        let delays: Vec<u64> = (0..5)
            .map(|n| registration.backoff(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_rejects_invalid_combinations() {
        let valid = UserAgentConfig::new("sip:alice@example.com", vec![udp(5060)]);
        assert!(valid.validate().is_ok());

        let mut config = valid.clone();
        config.transports.clear();
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let mut config = valid.clone();
        config.transports.push(udp(5060));
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
        // same port on another protocol is fine, as are ephemeral ports
        config.transports[1].kind = TransportKind::Tcp;
        config.transports.push(udp(0));
        config.transports.push(udp(0));
        assert!(config.validate().is_ok());

        let mut config = valid.clone();
        config.identity = "tel:+15551234".to_string();
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let mut config = valid.clone();
        config.srtp = SrtpPolicy::Mandatory;
        config.codecs.clear();
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let mut config = valid.clone();
        config.timers.max_retransmits = 0;
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let mut config = valid.clone();
        config.registration = Some(RegistrationConfig {
            server: "sip:registrar.example.com".to_string(),
            initial_backoff_ms: 0,
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let mut config = valid;
        config.registration = Some(RegistrationConfig {
            server: "sip:registrar.example.com".to_string(),
            initial_backoff_ms: 2000,
            max_backoff_ms: 1000,
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_bad_toml_is_a_config_error() {
        assert!(matches!(
            UserAgentConfig::from_toml_str("identity = 5"),
            Err(Error::ConfigError(_))
        ));
    }
}
