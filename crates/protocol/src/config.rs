use serde::{Deserialize, Serialize};

/// Top-level relay configuration: networking, WebRTC media engine, and mesh identity.
///
/// Every field here is reachable from an environment variable (the contract named in
/// the external-interfaces section) as well as an optional TOML config file; env vars
/// take precedence since that's how the process is normally deployed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webrtc: WebrtcConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// ENDPOINT_PORT — port the WebSocket/control HTTP endpoint listens on.
    #[serde(default = "default_endpoint_port")]
    pub port: u16,
    /// TLS_CERT — path to a PEM certificate. Both cert and key must be set to enable TLS.
    pub tls_cert: Option<String>,
    /// TLS_KEY — path to a PEM private key.
    pub tls_key: Option<String>,
    /// CONTROL_SECRET — shared secret gating `/api/control`. Unset disables the endpoint.
    pub control_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrtcConfig {
    /// STUN_SERVER — STUN server used as the default (and, absent TURN, only) ICE server.
    #[serde(default = "default_stun_server")]
    pub stun_server: String,
    /// WEBRTC_UDP_START — start of the ephemeral UDP port range (0 disables the range).
    #[serde(default)]
    pub udp_port_start: u16,
    /// WEBRTC_UDP_END — end of the ephemeral UDP port range.
    #[serde(default)]
    pub udp_port_end: u16,
    /// WEBRTC_UDP_MUX — port for a single reused UDP socket muxing all ICE candidates.
    /// 0 disables the mux (each peer connection gets its own ephemeral sockets).
    #[serde(default)]
    pub udp_mux_port: u16,
    /// WEBRTC_NAT_IP — 1:1 NAT IP to advertise in ICE candidates, for relays behind a
    /// static public IP without a STUN-discoverable mapping.
    pub nat_1to1_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// PERSIST_DIR — directory holding the persisted Ed25519 identity key.
    #[serde(default = "default_persist_dir")]
    pub persist_dir: String,
    /// REGEN_IDENTITY — if true, a fresh identity is generated (and persisted) on boot
    /// even if one already exists at `persist_dir`.
    #[serde(default)]
    pub regen_identity: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_endpoint_port(),
            tls_cert: None,
            tls_key: None,
            control_secret: None,
        }
    }
}

impl Default for WebrtcConfig {
    fn default() -> Self {
        Self {
            stun_server: default_stun_server(),
            udp_port_start: 0,
            udp_port_end: 0,
            udp_mux_port: 0,
            nat_1to1_ip: None,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            persist_dir: default_persist_dir(),
            regen_identity: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            webrtc: WebrtcConfig::default(),
            mesh: MeshConfig::default(),
        }
    }
}

fn default_endpoint_port() -> u16 {
    8088
}
fn default_stun_server() -> String {
    "stun.l.google.com:19302".to_string()
}
fn default_persist_dir() -> String {
    "./persist-data".to_string()
}

impl RelayConfig {
    /// Overlay values from environment variables named per the external-interfaces
    /// contract. Unset variables leave the current value (defaults, or whatever a
    /// config file already set) untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ENDPOINT_PORT")
            && let Ok(p) = v.parse()
        {
            self.server.port = p;
        }
        if let Ok(v) = std::env::var("TLS_CERT") {
            self.server.tls_cert = Some(v);
        }
        if let Ok(v) = std::env::var("TLS_KEY") {
            self.server.tls_key = Some(v);
        }
        if let Ok(v) = std::env::var("CONTROL_SECRET") {
            self.server.control_secret = Some(v);
        }
        if let Ok(v) = std::env::var("STUN_SERVER") {
            self.webrtc.stun_server = v;
        }
        if let Ok(v) = std::env::var("WEBRTC_UDP_START")
            && let Ok(p) = v.parse()
        {
            self.webrtc.udp_port_start = p;
        }
        if let Ok(v) = std::env::var("WEBRTC_UDP_END")
            && let Ok(p) = v.parse()
        {
            self.webrtc.udp_port_end = p;
        }
        if let Ok(v) = std::env::var("WEBRTC_UDP_MUX")
            && let Ok(p) = v.parse()
        {
            self.webrtc.udp_mux_port = p;
        }
        if let Ok(v) = std::env::var("WEBRTC_NAT_IP") {
            self.webrtc.nat_1to1_ip = Some(v);
        }
        if let Ok(v) = std::env::var("PERSIST_DIR") {
            self.mesh.persist_dir = v;
        }
        if let Ok(v) = std::env::var("REGEN_IDENTITY") {
            self.mesh.regen_identity = matches!(v.as_str(), "1" | "true" | "TRUE" | "yes");
        }
    }

    /// Validate semantic constraints beyond what serde/type-checking already enforce.
    /// Returns `ERROR:`-prefixed issues (fatal, the process must not start) and
    /// `WARNING:`-prefixed issues (advisory) together; callers decide how to act on each.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(_), None) | (None, Some(_)) => {
                issues.push(
                    "ERROR: both tls_cert and tls_key must be set to enable TLS, or neither \
                     (to serve plain HTTP)."
                        .to_string(),
                );
            }
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: tls_cert '{cert}' does not exist."));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: tls_key '{key}' does not exist."));
                }
            }
            (None, None) => {}
        }

        if self.webrtc.udp_port_start > 0 || self.webrtc.udp_port_end > 0 {
            if self.webrtc.udp_port_start == 0 || self.webrtc.udp_port_end == 0 {
                issues.push(
                    "WARNING: only one of WEBRTC_UDP_START/WEBRTC_UDP_END is set; the \
                     ephemeral port range requires both and will be ignored."
                        .to_string(),
                );
            } else if self.webrtc.udp_port_start >= self.webrtc.udp_port_end {
                issues.push(format!(
                    "ERROR: WEBRTC_UDP_START ({}) must be less than WEBRTC_UDP_END ({}).",
                    self.webrtc.udp_port_start, self.webrtc.udp_port_end
                ));
            }
        }

        if !self.webrtc.stun_server.is_empty()
            && self.webrtc.stun_server.contains("://")
        {
            issues.push(format!(
                "WARNING: STUN_SERVER '{}' looks like a URL; expected a bare host:port \
                 (e.g. stun.l.google.com:19302).",
                self.webrtc.stun_server
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_contract() {
        let config = RelayConfig::default();
        assert_eq!(config.server.port, 8088);
        assert!(config.server.tls_cert.is_none());
        assert!(config.server.control_secret.is_none());
        assert_eq!(config.webrtc.stun_server, "stun.l.google.com:19302");
        assert_eq!(config.webrtc.udp_port_start, 0);
        assert_eq!(config.webrtc.udp_mux_port, 0);
        assert_eq!(config.mesh.persist_dir, "./persist-data");
        assert!(!config.mesh.regen_identity);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_overlays_only_named_fields() {
        let toml_str = r#"
[server]
port = 9000
"#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.webrtc.stun_server, "stun.l.google.com:19302");
    }

    #[test]
    fn mismatched_tls_pair_is_an_error() {
        let mut config = RelayConfig::default();
        config.server.tls_cert = Some("/nonexistent/cert.pem".to_string());
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn udp_range_start_after_end_is_an_error() {
        let mut config = RelayConfig::default();
        config.webrtc.udp_port_start = 50000;
        config.webrtc.udp_port_end = 40000;
        let issues = config.validate().unwrap_err();
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("ERROR:") && i.contains("WEBRTC_UDP_START"))
        );
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut config = RelayConfig::default();
        config.server.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("server.port")));
    }
}
