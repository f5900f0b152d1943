use clap::Parser;
use eyre::{ensure, Result};
use std::{convert::Infallible, fmt, str::FromStr};

/// Minimum accepted signing secret length in bytes.
const MIN_SECRET_LEN: usize = 16;

/// Signing key material as read from the environment. Holds raw bytes and
/// never exposes them through `Debug`, so an `Options` dump stays safe to
/// log.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn meets_minimum_length(&self) -> bool {
        self.0.len() >= MIN_SECRET_LEN
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({} bytes)", self.0.len())
    }
}

impl FromStr for SecretKey {
    type Err = Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(Self(raw.as_bytes().to_vec()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[group(skip)]
pub struct Options {
    /// Primary admission token signing key.
    #[clap(long, env = "TOKEN_SECRET", hide_env_values = true)]
    pub token_secret: SecretKey,

    /// Previous signing key, accepted for verification only. Set during
    /// rotation, unset once old tokens have expired.
    #[clap(long, env = "TOKEN_SECRET_PREV", hide_env_values = true)]
    pub token_secret_prev: Option<SecretKey>,
}

/// Signing key material shared by the token generator and verifier.
///
/// Generation always uses the primary key; verification accepts the primary
/// plus the optional previous key so rotation is a configuration change.
pub struct Keys {
    primary: Vec<u8>,
    accepted: Vec<Vec<u8>>,
}

impl Keys {
    pub fn new(options: &Options) -> Result<Self> {
        ensure!(
            options.token_secret.meets_minimum_length(),
            "TOKEN_SECRET must be at least {MIN_SECRET_LEN} bytes"
        );
        let primary = options.token_secret.as_bytes().to_vec();

        let mut accepted = vec![primary.clone()];
        if let Some(prev) = &options.token_secret_prev {
            ensure!(
                prev.meets_minimum_length(),
                "TOKEN_SECRET_PREV must be at least {MIN_SECRET_LEN} bytes"
            );
            accepted.push(prev.as_bytes().to_vec());
        }

        Ok(Self { primary, accepted })
    }

    #[must_use]
    pub fn primary(&self) -> &[u8] {
        &self.primary
    }

    /// All keys valid for verification, primary first.
    #[must_use]
    pub fn accepted(&self) -> &[Vec<u8>] {
        &self.accepted
    }
}
