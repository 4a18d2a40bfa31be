//! Definitions to read and write a Sonic node configuration and its key files.
//!
//! The configuration is a TOML file. Network rules are not part of it: they
//! come from the genesis and from governance.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    fmt::Display,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use serde::{Deserialize, Serialize};
use sonic_primitives::ValidatorId;
use sonic_scc::{BlsPublicKey, BlsSecretKey};

#[cfg(test)]
mod tests;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Root of the node's data directory.
    pub datadir: PathBuf,
    /// `fake:<validators>[:<upgrades>]` or the path of a signed JSON genesis.
    /// Required when the data directory is empty.
    #[serde(default)]
    pub genesis: Option<String>,
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Present on validator nodes only.
    #[serde(default)]
    pub validator: Option<ValidatorConfig>,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub emitter: EmitterConfig,
    #[serde(default)]
    pub txpool: TxPoolConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([127, 0, 0, 1], 18545)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorConfig {
    pub id: ValidatorId,
    /// Hex file with the secp256k1 key events are signed with.
    pub event_key: PathBuf,
    /// Hex file with the BLS key certificates are signed with.
    pub bls_key: PathBuf,
}

/// Capacities of the bounded queues between the node's workers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ChannelsConfig {
    /// Decoded events from peers waiting for admission.
    pub events: usize,
    /// Admitted events waiting for the consensus engine.
    pub admitted: usize,
    /// Decided batches waiting for the block former.
    pub batches: usize,
    /// Committed blocks waiting for certification.
    pub blocks: usize,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            events: 4_096,
            admitted: 4_096,
            batches: 256,
            blocks: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ShutdownConfig {
    /// How long workers may drain their queues after a stop signal.
    pub drain_deadline_ms: u64,
}

impl ShutdownConfig {
    pub const fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_deadline_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EmitterConfig {
    /// Validators create events only when enabled.
    pub enabled: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TxPoolConfig {
    /// Pending transactions kept before new ones are refused.
    pub capacity: usize,
    /// Accept legacy transactions signed without a chain id.
    pub allow_unprotected: bool,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 16_384,
            allow_unprotected: false,
        }
    }
}

impl Config {
    /// A configuration with defaults for everything but the data directory.
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        Self {
            datadir: datadir.into(),
            genesis: None,
            rpc: RpcConfig::default(),
            validator: None,
            channels: ChannelsConfig::default(),
            shutdown: ShutdownConfig::default(),
            emitter: EmitterConfig::default(),
            txpool: TxPoolConfig::default(),
        }
    }

    /// Reads a configuration file. Relative paths inside it are resolved
    /// against the directory the file lives in.
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigErrorKind::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&contents)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(ConfigErrorKind::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self).map_err(ConfigErrorKind::Serialize)?)
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?).map_err(|source| ConfigErrorKind::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let channels = &self.channels;
        if [channels.events, channels.admitted, channels.batches, channels.blocks].contains(&0) {
            return Err(ConfigErrorKind::Invalid("channel capacities must be positive").into());
        }
        if self.txpool.capacity == 0 {
            return Err(ConfigErrorKind::Invalid("the transaction pool needs a positive capacity").into());
        }
        if let Some(validator) = &self.validator
            && validator.id == 0
        {
            return Err(ConfigErrorKind::Invalid("validator ids start at 1").into());
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.datadir);
        if let Some(validator) = &mut self.validator {
            resolve(&mut validator.event_key);
            resolve(&mut validator.bls_key);
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ConfigError(ConfigErrorKind);

impl From<ConfigErrorKind> for ConfigError {
    fn from(value: ConfigErrorKind) -> Self {
        Self(value)
    }
}

#[derive(Debug, thiserror::Error)]
enum ConfigErrorKind {
    #[error("failed reading config file `{path}`")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed writing config file `{path}`")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed parsing config")]
    Parse(#[source] toml::de::Error),
    #[error("failed serializing config")]
    Serialize(#[source] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// The secp256k1 key a validator signs its events with.
#[derive(Clone)]
pub struct EventKey {
    inner: PrivateKeySigner,
}

impl std::fmt::Debug for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventKey")
            .field("address", &self.inner.address())
            .finish_non_exhaustive()
    }
}

impl EventKey {
    pub fn random() -> Self {
        Self {
            inner: PrivateKeySigner::random(),
        }
    }

    pub fn into_inner(self) -> PrivateKeySigner {
        self.inner
    }

    pub fn address(&self) -> Address {
        self.inner.address()
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self, KeyFileError> {
        let hex = std::fs::read_to_string(path).map_err(KeyFileErrorKind::Read)?;
        Self::try_from_hex(hex.trim())
    }

    pub fn try_from_hex(hex: &str) -> Result<Self, KeyFileError> {
        let bytes = const_hex::decode(hex).map_err(KeyFileErrorKind::Hex)?;
        let inner = PrivateKeySigner::from_slice(&bytes)
            .map_err(|_| KeyFileErrorKind::Parse("secp256k1"))?;
        Ok(Self { inner })
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), KeyFileError> {
        std::fs::write(path, self.to_string()).map_err(KeyFileErrorKind::Write)?;
        Ok(())
    }
}

impl Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&const_hex::encode_prefixed(self.inner.to_bytes()))
    }
}

impl From<PrivateKeySigner> for EventKey {
    fn from(inner: PrivateKeySigner) -> Self {
        Self { inner }
    }
}

/// The BLS key a validator signs block and committee statements with.
#[derive(Debug)]
pub struct BlsKey {
    inner: BlsSecretKey,
}

impl BlsKey {
    pub fn into_inner(self) -> BlsSecretKey {
        self.inner
    }

    pub fn public_key(&self) -> BlsPublicKey {
        self.inner.public_key()
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self, KeyFileError> {
        let hex = std::fs::read_to_string(path).map_err(KeyFileErrorKind::Read)?;
        Self::try_from_hex(hex.trim())
    }

    pub fn try_from_hex(hex: &str) -> Result<Self, KeyFileError> {
        let bytes = const_hex::decode(hex).map_err(KeyFileErrorKind::Hex)?;
        let inner = BlsSecretKey::from_bytes(&bytes).map_err(|_| KeyFileErrorKind::Parse("bls"))?;
        Ok(Self { inner })
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), KeyFileError> {
        std::fs::write(path, self.to_string()).map_err(KeyFileErrorKind::Write)?;
        Ok(())
    }
}

impl Display for BlsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&const_hex::encode_prefixed(self.inner.to_bytes()))
    }
}

impl From<BlsSecretKey> for BlsKey {
    fn from(inner: BlsSecretKey) -> Self {
        Self { inner }
    }
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct KeyFileError {
    #[from]
    inner: KeyFileErrorKind,
}

#[derive(Debug, thiserror::Error)]
enum KeyFileErrorKind {
    #[error("failed decoding file contents as hex-encoded bytes")]
    Hex(#[source] const_hex::FromHexError),
    #[error("hex-decoded bytes are not a valid {0} secret key")]
    Parse(&'static str),
    #[error("failed reading file")]
    Read(#[source] std::io::Error),
    #[error("failed writing to file")]
    Write(#[source] std::io::Error),
}
