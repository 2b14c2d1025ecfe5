//! SSH transport built on async-ssh2-tokio / russh.
//!
//! Network gear frequently runs SSH stacks a decade behind the desktop
//! world, so the connection is negotiated with a broad algorithm preference
//! list that keeps legacy Diffie-Hellman groups and CBC ciphers available.

use std::borrow::Cow;
use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use async_trait::async_trait;
use log::debug;
use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{ChannelMsg, Preferred, cipher, compression, kex, mac};
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::Transport;
use crate::device::{Credentials, mask};
use crate::error::BackupError;

/// Key exchange preference, modern first, legacy groups kept for old devices.
const COMPAT_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA256,
    kex::DH_GEX_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G14_SHA1,
    kex::DH_G1_SHA1,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
];

/// Cipher preference, including CBC modes still common on routers.
const COMPAT_CIPHERS: &[cipher::Name] = &[
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_256_GCM,
    cipher::CHACHA20_POLY1305,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
];

const COMPAT_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA1_ETM,
];

const COMPAT_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Dsa,
];

const COMPAT_COMPRESSION: &[compression::Name] =
    &[compression::NONE, compression::ZLIB, compression::ZLIB_LEGACY];

fn compat_preferred() -> Preferred {
    Preferred {
        kex: Cow::Borrowed(COMPAT_KEX_ORDER),
        key: Cow::Borrowed(COMPAT_KEY_TYPES),
        cipher: Cow::Borrowed(COMPAT_CIPHERS),
        mac: Cow::Borrowed(COMPAT_MAC_ALGORITHMS),
        compression: Cow::Borrowed(COMPAT_COMPRESSION),
    }
}

/// SSH session transport. Lives for a single backup attempt.
pub struct SshTransport {
    address: String,
    port: u16,
    creds: Credentials,
    client: Option<Client>,
    sender: Option<Sender<String>>,
    recv: Option<Receiver<String>>,
}

impl SshTransport {
    /// Prepares a transport for the resolved address; call `connect` to use.
    pub fn new(address: &str, creds: Credentials) -> Self {
        Self {
            address: address.to_string(),
            port: 22,
            creds,
            client: None,
            sender: None,
            recv: None,
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&mut self) -> Result<(), BackupError> {
        let config = Config {
            preferred: compat_preferred(),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        debug!(
            "{} -> ssh connect (user: {}, password: {})",
            self.address,
            self.creds.username,
            mask(&self.creds.password)
        );

        let client = match Client::connect_with_config(
            (self.address.clone(), self.port),
            &self.creds.username,
            AuthMethod::with_password(&self.creds.password),
            ServerCheckMethod::NoCheck,
            config,
        )
        .await
        {
            Ok(client) => client,
            Err(err) => {
                let text = err.to_string().to_ascii_lowercase();
                if text.contains("auth") || text.contains("password") {
                    debug!("{} ssh login rejected", self.address);
                    return Err(BackupError::AuthFailed);
                }
                return Err(BackupError::Unreachable(format!("{}: {err}", self.address)));
            }
        };
        debug!("{} TCP connection successful", self.address);

        let mut channel = client.get_channel().await?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        debug!("{} shell request successful", self.address);

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);

        let io_task_addr = self.address.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = receiver_from_user.recv() => {
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{} failed to send data to shell: {:?}", io_task_addr, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                if let Ok(s) = std::str::from_utf8(data)
                                    && sender_to_user.send(s.to_string()).await.is_err() {
                                        debug!("{} shell output receiver dropped. Closing task.", io_task_addr);
                                        break;
                                    }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} shell exited with status code: {}", io_task_addr, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} shell sent EOF.", io_task_addr);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
            debug!("{} SSH I/O task ended.", io_task_addr);
        });

        self.client = Some(client);
        self.sender = Some(sender_to_shell);
        self.recv = Some(receiver_from_shell);
        Ok(())
    }

    async fn send(&mut self, data: &str) -> Result<(), BackupError> {
        let sender = self.sender.as_ref().ok_or(BackupError::ChannelClosed)?;
        sender
            .send(data.to_string())
            .await
            .map_err(|_| BackupError::ChannelClosed)
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Option<String>, BackupError> {
        let recv = self.recv.as_mut().ok_or(BackupError::ChannelClosed)?;
        match tokio::time::timeout(timeout, recv.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => Err(BackupError::ChannelClosed),
        }
    }

    async fn disconnect(&mut self, graceful: bool) {
        if let Some(recv) = self.recv.as_mut() {
            recv.close();
        }
        if graceful && let Some(sender) = self.sender.as_ref() {
            // Best effort; the device may already have hung up.
            let _ = sender.send("exit\n".to_string()).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // async-ssh2-tokio closes the underlying connection on drop.
        self.sender = None;
        self.recv = None;
        self.client = None;
        debug!("{} ssh session closed", self.address);
    }

    fn peer_ip(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compat_preference_keeps_legacy_algorithms() {
        let preferred = compat_preferred();
        assert!(preferred.kex.contains(&kex::DH_G1_SHA1));
        assert!(preferred.cipher.contains(&cipher::AES_256_CBC));
        assert!(preferred.key.contains(&Algorithm::Rsa { hash: None }));
    }

    #[test]
    fn compat_preference_excludes_null_algorithms() {
        let preferred = compat_preferred();
        assert!(preferred.kex.iter().all(|alg| *alg != kex::NONE));
        assert!(preferred.cipher.iter().all(|alg| *alg != cipher::NONE));
        assert!(preferred.cipher.iter().all(|alg| *alg != cipher::CLEAR));
        assert!(preferred.mac.iter().all(|alg| *alg != mac::NONE));
    }
}
