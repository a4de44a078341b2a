use russh::MethodSet;
use russh_keys::key::KeyPair;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::StartupError;

/// Where the server's host identity comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeySource {
    File(PathBuf),
    /// Fresh ed25519 key for this process only.
    Ephemeral,
}

/// Process-wide settings, built once at startup and only read afterwards.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub root: PathBuf,
    pub host_key: HostKeySource,
    pub password: String,
    pub inactivity_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn load_host_key(&self) -> Result<KeyPair, StartupError> {
        match &self.host_key {
            HostKeySource::File(path) => {
                tracing::info!("Loading host key from {}", path.display());
                russh_keys::load_secret_key(path, None).map_err(|e| StartupError::HostKey {
                    path: path.clone(),
                    reason: e.to_string(),
                })
            }
            HostKeySource::Ephemeral => {
                tracing::warn!("Using an ephemeral host key; clients will see a new fingerprint on every restart");
                KeyPair::generate_ed25519().ok_or(StartupError::KeyGeneration)
            }
        }
    }

    /// SSH server settings around the given host key.
    pub fn ssh_config(&self, key: KeyPair) -> russh::server::Config {
        russh::server::Config {
            methods: MethodSet::PASSWORD,
            inactivity_timeout: self.inactivity_timeout,
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![key],
            window_size: 2097152, // 2MB window
            maximum_packet_size: 32768, // 32KB packets
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn config(host_key: HostKeySource) -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:2222".parse().unwrap(),
            root: PathBuf::from("/srv"),
            host_key,
            password: "password".to_string(),
            inactivity_timeout: None,
        }
    }

    #[test]
    fn test_missing_host_key_is_fatal() {
        let dir = TempDir::new("host_key").unwrap();
        let path = dir.path().join("id_rsa");
        match config(HostKeySource::File(path.clone())).load_host_key() {
            Err(StartupError::HostKey { path: reported, .. }) => assert_eq!(reported, path),
            _ => panic!("a missing key must not load"),
        }
    }

    #[test]
    fn test_garbage_host_key_is_fatal() {
        let dir = TempDir::new("host_key").unwrap();
        let path = dir.path().join("id_rsa");
        std::fs::write(&path, "not a key").unwrap();
        assert!(matches!(
            config(HostKeySource::File(path)).load_host_key(),
            Err(StartupError::HostKey { .. })
        ));
    }

    #[test]
    fn test_ephemeral_key_and_ssh_config() {
        let mut config = config(HostKeySource::Ephemeral);
        config.inactivity_timeout = Some(Duration::from_secs(30));
        let key = config.load_host_key().unwrap();

        let ssh = config.ssh_config(key);
        assert_eq!(ssh.keys.len(), 1);
        assert_eq!(ssh.methods, MethodSet::PASSWORD);
        assert_eq!(ssh.inactivity_timeout, Some(Duration::from_secs(30)));
    }
}
