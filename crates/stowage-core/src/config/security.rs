//! Config-at-rest encryption settings.

use serde::{Deserialize, Serialize};

/// Controls whether storage configuration is sealed before it is persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Seal storage `config` maps at rest.
    #[serde(default)]
    pub crypt: bool,
    /// Passphrase the sealing key is derived from. Required when `crypt` is on.
    #[serde(default)]
    pub crypt_key: String,
}
