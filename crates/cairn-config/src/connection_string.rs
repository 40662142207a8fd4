//! `Key=Value;Key=Value` connection strings.
//!
//! Keys are case-insensitive and ignore whitespace and underscores, so
//! `MaxRetries`, `max_retries` and `Max Retries` are the same key. Duration
//! values are milliseconds. Unknown keys are an error.

use cairn_types::{Credentials, Endpoint, NodePreference};

use crate::{ConfigError, ConnectionOptions, DEFAULT_GOSSIP_PORT, DEFAULT_TCP_PORT};

impl ConnectionOptions {
    /// Parses a connection string on top of the default options.
    pub fn from_connection_string(input: &str) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        for item in input.split(';') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = item.split_once('=').ok_or_else(|| {
                ConfigError::InvalidConnectionString(format!("expected key=value, found '{item}'"))
            })?;
            options.apply(key.trim(), value.trim())?;
        }
        Ok(options)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match normalize_key(key).as_str() {
            "connectto" => self.connect_to = Some(value.to_string()),
            "gossipseeds" => {
                self.gossip_seeds = value
                    .split(',')
                    .map(str::trim)
                    .filter(|seed| !seed.is_empty())
                    .map(String::from)
                    .collect();
            }
            "clusterdns" => self.cluster_dns = Some(value.to_string()),
            "gossipport" | "externalgossipport" => self.gossip_port = parse_number(key, value)?,
            "connectionname" => self.connection_name = Some(value.to_string()),
            "usesslconnection" | "usetls" => self.use_tls = parse_bool(key, value)?,
            "validateserver" => self.validate_server = parse_bool(key, value)?,
            "maxqueuesize" => self.max_queue_size = parse_number(key, value)?,
            "maxconcurrentitems" => self.max_concurrent_items = parse_number(key, value)?,
            "maxretries" => self.max_retries = parse_number(key, value)?,
            "maxreconnections" => self.max_reconnections = parse_number(key, value)?,
            "requireleader" | "requiremaster" => self.require_leader = parse_bool(key, value)?,
            "reconnectiondelay" => self.reconnection_delay_ms = parse_number(key, value)?,
            "queuetimeout" => self.queue_timeout_ms = parse_number(key, value)?,
            "operationtimeout" => self.operation_timeout_ms = parse_number(key, value)?,
            "operationtimeoutcheckperiod" => {
                self.operation_timeout_check_period_ms = parse_number(key, value)?;
            }
            "heartbeatinterval" => self.heartbeat_interval_ms = parse_number(key, value)?,
            "heartbeattimeout" => self.heartbeat_timeout_ms = parse_number(key, value)?,
            "clientconnectiontimeout" => {
                self.client_connection_timeout_ms = parse_number(key, value)?;
            }
            "maxdiscoverattempts" => self.max_discover_attempts = parse_number(key, value)?,
            "gossiptimeout" => self.gossip_timeout_ms = parse_number(key, value)?,
            "nodepreference" => {
                self.node_preference = value
                    .parse::<NodePreference>()
                    .map_err(|e| ConfigError::invalid_value(key, value, e.to_string()))?;
            }
            "failonnoserverresponse" => {
                self.fail_on_no_server_response = parse_bool(key, value)?;
            }
            "verboselogging" => self.verbose_logging = parse_bool(key, value)?,
            "defaultusercredentials" => self.default_user_credentials = Some(value.to_string()),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::invalid_value(key, value, "expected true or false")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::invalid_value(key, value, "expected a whole number"))
}

/// Target named by a `ConnectTo` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// `tcp://[user:pass@]host[:port]`, a single node.
    Tcp {
        endpoint: Endpoint,
        credentials: Option<Credentials>,
    },
    /// `discover://[user:pass@]host[:port]`, a cluster behind a DNS name.
    Discover {
        host: String,
        port: Option<u16>,
        credentials: Option<Credentials>,
    },
}

/// Parses a `ConnectTo` URI.
pub fn parse_connect_to(uri: &str) -> Result<ConnectTarget, ConfigError> {
    let invalid = |reason: &str| ConfigError::invalid_value("connect_to", uri, reason);

    let (scheme, rest) = uri
        .trim()
        .split_once("://")
        .ok_or_else(|| invalid("expected scheme://host[:port]"))?;
    let rest = rest.trim_end_matches('/');

    let (credentials, authority) = match rest.rsplit_once('@') {
        Some((userinfo, authority)) => {
            let credentials = userinfo
                .parse::<Credentials>()
                .map_err(|_| invalid("user info must be user:password"))?;
            (Some(credentials), authority)
        }
        None => (None, rest),
    };

    match scheme.to_ascii_lowercase().as_str() {
        "tcp" => {
            let endpoint = Endpoint::parse_with_default_port(authority, DEFAULT_TCP_PORT)
                .map_err(|e| invalid(&e.to_string()))?;
            Ok(ConnectTarget::Tcp {
                endpoint,
                credentials,
            })
        }
        "discover" => {
            let endpoint = Endpoint::parse_with_default_port(authority, DEFAULT_GOSSIP_PORT)
                .map_err(|e| invalid(&e.to_string()))?;
            let explicit_port = authority.rsplit_once(':').is_some() && !authority.ends_with(']');
            Ok(ConnectTarget::Discover {
                host: endpoint.host,
                port: explicit_port.then_some(endpoint.port),
                credentials,
            })
        }
        other => Err(invalid(&format!("unsupported scheme '{other}'"))),
    }
}
