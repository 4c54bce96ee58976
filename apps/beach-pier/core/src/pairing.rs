use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::token::AuthToken;

/// Everything a device needs to pair with a host, serialized as JSON so the
/// owner can move it across by QR code or copy/paste.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayload {
    pub host: String,
    pub port: u16,
    pub fingerprint: String,
    pub token: String,
    pub protocol_version: u32,
}

impl PairingPayload {
    pub fn new(host: impl Into<String>, port: u16, fingerprint: impl Into<String>, token: &AuthToken) -> Self {
        Self {
            host: host.into(),
            port,
            fingerprint: fingerprint.into(),
            token: token.to_hex(),
            protocol_version: crate::PROTOCOL_VERSION,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| CoreError::Serialization(err.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| CoreError::Serialization(err.to_string()))
    }

    pub fn auth_token(&self) -> Result<AuthToken> {
        self.token
            .parse()
            .map_err(|err| CoreError::Serialization(format!("pairing token: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_carries_every_field() {
        let token = AuthToken::generate();
        let payload = PairingPayload::new("192.168.1.20", 8443, "ab:cd", &token);
        let json = payload.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["host"], "192.168.1.20");
        assert_eq!(value["port"], 8443);
        assert_eq!(value["fingerprint"], "ab:cd");
        assert_eq!(value["token"], token.to_hex());
        assert_eq!(value["protocol_version"], crate::PROTOCOL_VERSION);

        let parsed = PairingPayload::from_json(&json).unwrap();
        assert_eq!(parsed.auth_token().unwrap(), token);
    }
}
