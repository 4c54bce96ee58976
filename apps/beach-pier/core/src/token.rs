use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TOKEN_LEN: usize = 32;

/// 256-bit pairing secret handed to the device owner out of band.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthToken([u8; TOKEN_LEN]);

impl AuthToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// Keep the secret out of logs.
impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken({}…)", &self.to_hex()[..8])
    }
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenParseError {
    #[error("token is not valid hex")]
    InvalidHex,
    #[error("token must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

impl FromStr for AuthToken {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| TokenParseError::InvalidHex)?;
        let array: [u8; TOKEN_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| TokenParseError::InvalidLength {
                    expected: TOKEN_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }
}
