use std::env;

use thiserror::Error;

#[derive(Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub provisioner_url: String,
    pub provisioner_token: String,
    pub agent_port: u16,
    pub default_region: String,
    pub default_machine_class: String,
    pub peer_key_secret: [u8; 32],
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("PEER_KEY_SECRET must be exactly 64 hex characters (32 bytes)")]
    InvalidKeySecret,

    #[error("AGENT_PORT must be a valid port number")]
    InvalidAgentPort,
}

fn require_env(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingEnvVar { var })
}

fn parse_hex_32(hex: &str) -> Result<[u8; 32], ConfigError> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(ConfigError::InvalidKeySecret);
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte =
            u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| ConfigError::InvalidKeySecret)?;
    }
    Ok(out)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let peer_key_hex = require_env("PEER_KEY_SECRET")?;
        let peer_key_secret = parse_hex_32(&peer_key_hex)?;

        let agent_port = env::var("AGENT_PORT")
            .unwrap_or_else(|_| "51821".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidAgentPort)?;

        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            jwt_secret: require_env("JWT_SECRET")?,
            provisioner_url: require_env("PROVISIONER_URL")?,
            provisioner_token: require_env("PROVISIONER_TOKEN")?,
            agent_port,
            default_region: env::var("DEFAULT_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            default_machine_class: env::var("DEFAULT_MACHINE_CLASS")
                .unwrap_or_else(|_| "t3.micro".to_string()),
            peer_key_secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("" ; "empty")]
    #[test_case("abcd" ; "too short")]
    #[test_case("zz00000000000000000000000000000000000000000000000000000000000000" ; "non hex")]
    fn rejects_bad_key_secret(hex: &str) {
        assert!(parse_hex_32(hex).is_err());
    }

    #[test]
    fn parses_valid_key_secret() {
        let hex = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let parsed = parse_hex_32(hex).unwrap();
        assert_eq!(parsed[0], 0x00);
        assert_eq!(parsed[1], 0x11);
        assert_eq!(parsed[31], 0xff);
    }
}
