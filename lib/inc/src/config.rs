//! Endpoint configuration: serde-backed value structs with programmatic
//! setters and TOML loading.

use serde_derive::{Deserialize, Serialize};

use crate::error::{IncError, IncResult};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMethod {
    None,
    Tls1_2,
    Tls1_3,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Exact version match required.
    Strict,
    /// Within the advertised min-max range.
    Compatible,
    /// Accept anything, warn on mismatch.
    Permissive,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionRequirement {
    Optional,
    Preferred,
    Required,
}

/// Client endpoint options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Used by `connect("")`.
    pub default_server: String,
    pub protocol_version_current: u16,
    pub protocol_version_min: u16,
    pub protocol_version_max: u16,
    /// Forces inline copies and skips the SHM capability advertisement.
    pub disable_shared_memory: bool,
    pub shared_memory_size: usize,
    pub disable_memfd: bool,
    pub encryption_method: EncryptionMethod,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    /// Zero means unlimited.
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> ContextConfig {
        ContextConfig {
            default_server: String::new(),
            protocol_version_current: 1,
            protocol_version_min: 1,
            protocol_version_max: 1,
            disable_shared_memory: false,
            shared_memory_size: 64 * 1024 * 1024,
            disable_memfd: false,
            encryption_method: EncryptionMethod::None,
            auto_reconnect: true,
            reconnect_interval_ms: 500,
            max_reconnect_attempts: 5,
            connect_timeout_ms: 3000,
            operation_timeout_ms: 2000,
        }
    }
}

impl ContextConfig {
    pub fn load(path: &str) -> IncResult<ContextConfig> {
        serdeconv::from_toml_file(path).map_err(|_| IncError::InvalidArgs)
    }

    pub fn set_protocol_version_range(&mut self, current: u16, min: u16, max: u16) {
        self.protocol_version_current = current;
        self.protocol_version_min = min;
        self.protocol_version_max = max;
    }

    /// Shared-memory types this endpoint can use, as a capability bitmask.
    pub fn shared_memory_types(&self) -> u16 {
        if self.disable_shared_memory {
            return 0;
        }

        let mut types = crate::memory::MEMTYPE_POSIX;
        if !self.disable_memfd {
            types |= crate::memory::MEMTYPE_MEMFD;
        }
        types
    }
}

/// Listening endpoint options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    /// Selects the well-known system path when no address is given.
    pub system_instance: bool,
    pub version_policy: VersionPolicy,
    pub protocol_version_current: u16,
    pub protocol_version_min: u16,
    pub protocol_version_max: u16,
    /// Zero means unlimited.
    pub max_connections: u32,
    pub max_connections_per_client: u32,
    pub shared_memory_size: usize,
    pub shared_memory_name: String,
    pub disable_shared_memory: bool,
    pub disable_memfd: bool,
    pub max_message_size: u32,
    pub encryption_requirement: EncryptionRequirement,
    pub client_timeout_ms: u64,
    /// Negative means never exit.
    pub exit_idle_time_ms: i64,
    pub enable_io_thread: bool,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            listen_address: String::new(),
            system_instance: false,
            version_policy: VersionPolicy::Compatible,
            protocol_version_current: 1,
            protocol_version_min: 1,
            protocol_version_max: 1,
            max_connections: 100,
            max_connections_per_client: 10,
            shared_memory_size: 256 * 1024 * 1024,
            shared_memory_name: "ishell-inc".to_string(),
            disable_shared_memory: false,
            disable_memfd: false,
            max_message_size: 16 * 1024 * 1024,
            encryption_requirement: EncryptionRequirement::Optional,
            client_timeout_ms: 60_000,
            exit_idle_time_ms: -1,
            enable_io_thread: false,
        }
    }
}

pub const SYSTEM_INSTANCE_URL: &str = "unix:///tmp/ishell-system.sock";

impl ServerConfig {
    pub fn load(path: &str) -> IncResult<ServerConfig> {
        serdeconv::from_toml_file(path).map_err(|_| IncError::InvalidArgs)
    }

    pub fn set_protocol_version_range(&mut self, current: u16, min: u16, max: u16) {
        self.protocol_version_current = current;
        self.protocol_version_min = min;
        self.protocol_version_max = max;
    }

    /// The URL `listen_on("")` resolves to.
    pub fn effective_listen_address(&self) -> Option<String> {
        if !self.listen_address.is_empty() {
            return Some(self.listen_address.clone());
        }
        if self.system_instance {
            return Some(SYSTEM_INSTANCE_URL.to_string());
        }
        None
    }

    pub fn shared_memory_types(&self) -> u16 {
        if self.disable_shared_memory {
            return 0;
        }

        let mut types = crate::memory::MEMTYPE_POSIX;
        if !self.disable_memfd {
            types |= crate::memory::MEMTYPE_MEMFD;
        }
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_defaults_match_contract() {
        let config = ContextConfig::default();
        assert_eq!(config.shared_memory_size, 64 * 1024 * 1024);
        assert_eq!(config.reconnect_interval_ms, 500);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.operation_timeout_ms, 2000);
        assert!(config.auto_reconnect);
    }

    #[test]
    fn test_server_defaults_match_contract() {
        let config = ServerConfig::default();
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.shared_memory_size, 256 * 1024 * 1024);
        assert_eq!(config.client_timeout_ms, 60_000);
        assert_eq!(config.version_policy, VersionPolicy::Compatible);
        assert_eq!(config.encryption_requirement, EncryptionRequirement::Optional);
    }

    #[test]
    fn test_toml_parse() {
        let config: ServerConfig = serdeconv::from_toml_str(
            r#"
listen_address = "tcp://0.0.0.0:19000"
version_policy = "strict"
max_connections = 5
enable_io_thread = true
"#,
        )
        .unwrap();

        assert_eq!(config.listen_address, "tcp://0.0.0.0:19000");
        assert_eq!(config.version_policy, VersionPolicy::Strict);
        assert_eq!(config.max_connections, 5);
        assert!(config.enable_io_thread);
        // Unlisted fields keep their defaults.
        assert_eq!(config.client_timeout_ms, 60_000);
    }

    #[test]
    fn test_shared_memory_types() {
        let mut config = ContextConfig::default();
        assert_eq!(
            config.shared_memory_types(),
            crate::memory::MEMTYPE_POSIX | crate::memory::MEMTYPE_MEMFD
        );

        config.disable_memfd = true;
        assert_eq!(config.shared_memory_types(), crate::memory::MEMTYPE_POSIX);

        config.disable_shared_memory = true;
        assert_eq!(config.shared_memory_types(), 0);
    }

    #[test]
    fn test_effective_listen_address() {
        let mut config = ServerConfig::default();
        assert_eq!(config.effective_listen_address(), None);

        config.system_instance = true;
        assert_eq!(
            config.effective_listen_address(),
            Some(SYSTEM_INSTANCE_URL.to_string())
        );

        config.listen_address = "tcp://127.0.0.1:1900".to_string();
        assert_eq!(
            config.effective_listen_address(),
            Some("tcp://127.0.0.1:1900".to_string())
        );
    }
}
