//! Connection handshake: version negotiation and capability exchange.
//!
//! The client sends its data first; the server validates against its
//! policies and answers with its own. No payload crosses before both sides
//! complete. The capability set actually in force is the intersection of
//! the two advertisements.

use std::time::{SystemTime, UNIX_EPOCH};

use axon::logging::{self, Logger};

use crate::config::{ContextConfig, EncryptionMethod, EncryptionRequirement, ServerConfig, VersionPolicy};
use crate::tags::{TagReader, TagWriter};

pub const CAP_COMPRESSION: u32 = 0x01;
pub const CAP_ENCRYPTION: u32 = 0x02;
pub const CAP_STREAM: u32 = 0x04;
pub const CAP_PRIORITY: u32 = 0x08;
pub const CAP_MULTIPLEXING: u32 = 0x10;
pub const CAP_FILE_TRANSFER: u32 = 0x20;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Idle,
    Sending,
    Receiving,
    Completed,
    Failed,
}

/// The negotiation payload either side serialises.
#[derive(Debug, Clone, Default)]
pub struct HandshakeData {
    pub protocol_version: u32,
    pub node_name: String,
    pub node_id: String,
    pub capabilities: u32,
    pub auth_token: Vec<u8>,
}

impl HandshakeData {
    #[inline]
    pub fn has_capability(&self, capability: u32) -> bool {
        self.capabilities & capability != 0
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut tags = TagWriter::new();
        tags.put_u32(self.protocol_version)
            .put_string(&self.node_name)
            .put_string(&self.node_id)
            .put_u32(self.capabilities)
            .put_bytes(&self.auth_token);
        tags.finish()
    }

    pub fn deserialize(bytes: &[u8]) -> Option<HandshakeData> {
        let mut tags = TagReader::new(bytes);

        let protocol_version = tags.get_u32().ok()?;
        let node_name = tags.get_string().ok()?;
        let node_id = tags.get_string().ok()?;
        let capabilities = tags.get_u32().ok()?;
        // Auth token is optional; older peers may omit it.
        let auth_token = tags.get_bytes().unwrap_or_default();

        Some(HandshakeData {
            protocol_version,
            node_name,
            node_id,
            capabilities,
            auth_token,
        })
    }
}

fn default_node_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("node_{}_{}", std::process::id(), now)
}

/// Policy snapshot taken from the endpoint configuration.
struct Policy {
    version_policy: VersionPolicy,
    version_current: u32,
    version_min: u32,
    version_max: u32,
    require_encryption: bool,
    warn_encryption: bool,
}

impl Policy {
    fn permissive() -> Policy {
        Policy {
            version_policy: VersionPolicy::Permissive,
            version_current: 1,
            version_min: 1,
            version_max: 1,
            require_encryption: false,
            warn_encryption: false,
        }
    }
}

pub struct Handshake {
    role: Role,
    state: State,
    local: HandshakeData,
    remote: HandshakeData,
    policy: Policy,
    error_message: Option<String>,
    log: Logger,
}

impl Handshake {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(role: Role, log: L) -> Handshake {
        let log = logging::child(
            log,
            logging::o!("component" => "handshake", "role" => format!("{:?}", role)),
        );

        Handshake {
            role,
            state: State::Idle,
            local: HandshakeData {
                protocol_version: 1,
                node_id: default_node_id(),
                capabilities: CAP_STREAM,
                ..HandshakeData::default()
            },
            remote: HandshakeData::default(),
            policy: Policy::permissive(),
            error_message: None,
            log,
        }
    }

    /// Configure the client side: advertised version and capabilities plus
    /// acceptance rules for the server's answer.
    pub fn set_context_config(&mut self, node_name: &str, config: &ContextConfig) {
        self.local.node_name = node_name.to_string();
        self.local.protocol_version = config.protocol_version_current as u32;

        let mut capabilities = CAP_STREAM | CAP_MULTIPLEXING | CAP_FILE_TRANSFER;
        if config.encryption_method != EncryptionMethod::None {
            capabilities |= CAP_ENCRYPTION;
        }
        self.local.capabilities = capabilities;

        self.policy = Policy {
            version_policy: VersionPolicy::Compatible,
            version_current: config.protocol_version_current as u32,
            version_min: config.protocol_version_min as u32,
            version_max: config.protocol_version_max as u32,
            require_encryption: config.encryption_method != EncryptionMethod::None,
            warn_encryption: false,
        };
    }

    /// Configure the server side from its policy surface.
    pub fn set_server_config(&mut self, node_name: &str, config: &ServerConfig) {
        self.local.node_name = node_name.to_string();
        self.local.protocol_version = config.protocol_version_current as u32;

        let mut capabilities = CAP_STREAM | CAP_MULTIPLEXING | CAP_FILE_TRANSFER;
        if !config.disable_shared_memory {
            capabilities |= CAP_STREAM;
        }
        if config.encryption_requirement != EncryptionRequirement::Optional {
            capabilities |= CAP_ENCRYPTION;
        }
        self.local.capabilities = capabilities;

        self.policy = Policy {
            version_policy: config.version_policy,
            version_current: config.protocol_version_current as u32,
            version_min: config.protocol_version_min as u32,
            version_max: config.protocol_version_max as u32,
            require_encryption: config.encryption_requirement == EncryptionRequirement::Required,
            warn_encryption: config.encryption_requirement == EncryptionRequirement::Preferred,
        };
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn local_data(&self) -> &HandshakeData {
        &self.local
    }

    #[inline]
    pub fn remote_data(&self) -> &HandshakeData {
        &self.remote
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Client only: produce the opening payload.
    pub fn start(&mut self) -> Option<Vec<u8>> {
        if self.role != Role::Client {
            logging::warn!(self.log, "only the client side starts a handshake");
            return None;
        }

        if self.state != State::Idle {
            logging::warn!(self.log, "handshake already started");
            return None;
        }

        self.state = State::Sending;
        Some(self.local.serialize())
    }

    /// Feed the peer's payload. A server returns its own payload on
    /// success; a client returns `None` (nothing further to send).
    pub fn process(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        let remote = match HandshakeData::deserialize(bytes) {
            Some(remote) => remote,
            None => {
                self.state = State::Failed;
                self.error_message = Some("invalid handshake data format".to_string());
                return None;
            }
        };
        self.remote = remote;

        if !self.validate_remote() {
            self.state = State::Failed;
            return None;
        }

        self.state = State::Completed;
        logging::info!(self.log, "handshake completed";
                       "peer" => &self.remote.node_name,
                       "peer_version" => self.remote.protocol_version,
                       "capabilities" => self.negotiated_capabilities());

        match self.role {
            Role::Server => Some(self.local.serialize()),
            Role::Client => None,
        }
    }

    fn validate_remote(&mut self) -> bool {
        let remote_version = self.remote.protocol_version;

        match self.role {
            Role::Client => {
                if remote_version < self.policy.version_min
                    || remote_version > self.policy.version_max
                {
                    self.error_message = Some(format!(
                        "incompatible server protocol version: server={}, acceptable range=[{}, {}]",
                        remote_version, self.policy.version_min, self.policy.version_max
                    ));
                    return false;
                }

                if self.policy.require_encryption
                    && !self.remote.has_capability(CAP_ENCRYPTION)
                {
                    self.error_message =
                        Some("server does not support required encryption".to_string());
                    return false;
                }
            }
            Role::Server => {
                match self.policy.version_policy {
                    VersionPolicy::Strict => {
                        if remote_version != self.policy.version_current {
                            self.error_message = Some(format!(
                                "strict version policy: client={}, required={}",
                                remote_version, self.policy.version_current
                            ));
                            return false;
                        }
                    }
                    VersionPolicy::Compatible => {
                        if remote_version < self.policy.version_min
                            || remote_version > self.policy.version_max
                        {
                            self.error_message = Some(format!(
                                "incompatible client protocol version: client={}, acceptable range=[{}, {}]",
                                remote_version, self.policy.version_min, self.policy.version_max
                            ));
                            return false;
                        }
                    }
                    VersionPolicy::Permissive => {
                        if remote_version < self.policy.version_min
                            || remote_version > self.policy.version_max
                        {
                            logging::warn!(self.log,
                                           "client version outside acceptable range, allowing anyway";
                                           "client_version" => remote_version);
                        }
                    }
                }

                if self.policy.require_encryption
                    && !self.remote.has_capability(CAP_ENCRYPTION)
                {
                    self.error_message =
                        Some("client does not support required encryption".to_string());
                    return false;
                }

                if self.policy.warn_encryption && !self.remote.has_capability(CAP_ENCRYPTION) {
                    logging::warn!(self.log,
                                   "client does not support encryption, staying plain");
                }
            }
        }

        true
    }

    /// Capabilities both sides share. Zero until completed.
    pub fn negotiated_capabilities(&self) -> u32 {
        if self.state != State::Completed {
            return 0;
        }
        self.local.capabilities & self.remote.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_versions(current: u16, min: u16, max: u16) -> Handshake {
        let mut config = ContextConfig::default();
        config.protocol_version_current = current;
        config.protocol_version_min = min;
        config.protocol_version_max = max;

        let mut handshake = Handshake::new(Role::Client, None);
        handshake.set_context_config("client-node", &config);
        handshake
    }

    fn server_with_policy(policy: VersionPolicy) -> Handshake {
        let mut config = ServerConfig::default();
        config.version_policy = policy;

        let mut handshake = Handshake::new(Role::Server, None);
        handshake.set_server_config("server-node", &config);
        handshake
    }

    #[test]
    fn test_full_exchange() {
        let mut client = client_with_versions(1, 1, 1);
        let mut server = server_with_policy(VersionPolicy::Compatible);

        let hello = client.start().unwrap();
        assert_eq!(client.state(), State::Sending);

        let answer = server.process(&hello).unwrap();
        assert_eq!(server.state(), State::Completed);
        assert_eq!(server.remote_data().node_name, "client-node");

        assert!(client.process(&answer).is_none());
        assert_eq!(client.state(), State::Completed);
        assert_eq!(client.remote_data().node_name, "server-node");

        assert_ne!(client.negotiated_capabilities() & CAP_STREAM, 0);
        assert_eq!(
            client.negotiated_capabilities(),
            server.negotiated_capabilities()
        );
    }

    #[test]
    fn test_server_cannot_start() {
        let mut server = server_with_policy(VersionPolicy::Compatible);
        assert!(server.start().is_none());
        assert_eq!(server.state(), State::Idle);
    }

    #[test]
    fn test_strict_policy_rejects_other_version() {
        let mut client = client_with_versions(2, 1, 3);
        let mut server = server_with_policy(VersionPolicy::Strict);

        let hello = client.start().unwrap();
        assert!(server.process(&hello).is_none());
        assert_eq!(server.state(), State::Failed);
        assert!(server.error_message().unwrap().contains("strict"));
    }

    #[test]
    fn test_permissive_policy_accepts_with_warning() {
        let mut client = client_with_versions(9, 9, 9);
        let mut server = server_with_policy(VersionPolicy::Permissive);

        let hello = client.start().unwrap();
        assert!(server.process(&hello).is_some());
        assert_eq!(server.state(), State::Completed);
    }

    #[test]
    fn test_client_rejects_out_of_range_server() {
        let mut client = client_with_versions(1, 1, 1);
        let mut server = server_with_policy(VersionPolicy::Permissive);
        server.local.protocol_version = 7;

        let hello = client.start().unwrap();
        let answer = server.process(&hello).unwrap();

        client.process(&answer);
        assert_eq!(client.state(), State::Failed);
        assert!(client.error_message().unwrap().contains("incompatible"));
    }

    #[test]
    fn test_required_encryption_rejected_without_capability() {
        let mut config = ServerConfig::default();
        config.encryption_requirement = EncryptionRequirement::Required;
        let mut server = Handshake::new(Role::Server, None);
        server.set_server_config("server-node", &config);

        let mut client = client_with_versions(1, 1, 1);
        let hello = client.start().unwrap();

        assert!(server.process(&hello).is_none());
        assert_eq!(server.state(), State::Failed);
        assert!(server.error_message().unwrap().contains("encryption"));
    }

    #[test]
    fn test_garbage_payload_fails_cleanly() {
        let mut server = server_with_policy(VersionPolicy::Compatible);
        assert!(server.process(&[0xFF, 0x01, 0x02]).is_none());
        assert_eq!(server.state(), State::Failed);
    }

    #[test]
    fn test_node_id_generated() {
        let handshake = Handshake::new(Role::Client, None);
        assert!(handshake.local_data().node_id.starts_with("node_"));
    }
}
