//! Session authentication: basic and MD5-digest credentials with nonces.
//!
//! Credential state is tracked in both directions. `remote_authed` follows
//! the peer authenticating to us; `authed_to_remote` follows our credentials
//! being accepted by the peer. A failed inbound check is challenged once and
//! fails the session on repeat. MD5 is never downgraded to basic once
//! negotiated.
//!
//! Nonce key direction: a nonce row is keyed (authenticating device,
//! verifying device). When the peer authenticates to us the row is
//! (remote, local); when we authenticate to the peer it is (local, remote).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::persist::nonces::NonceStore;
use crate::persist::{Database, PersistError};
use crate::proto::{StatusCode, AUTH_FORMAT_BASIC, AUTH_FORMAT_MD5, FORMAT_ENCODING_B64, FORMAT_ENCODING_BIN};
use crate::wire::{Challenge, Credentials, HeaderParams, MetaParams, StatusParams};

/// Authentication scheme for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    Basic,
    Md5,
}

/// Result of examining inbound header credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAuth {
    /// Header carried no credentials or nothing needed doing.
    NotHandled,
    /// Credentials were examined; `status` must be emitted for the header.
    /// `abort` means authentication has conclusively failed.
    Handled {
        status: StatusCode,
        challenge: Option<Challenge>,
        abort: bool,
    },
    /// Protocol violation; abort without emitting a status.
    Abort,
}

/// Result of examining a status the peer sent for our header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAuth {
    NotHandled,
    /// Our credentials were accepted (or no longer needed).
    Ok,
    /// Authentication failed conclusively.
    Abort,
    /// Peer challenged us; resend the last message with fresh credentials.
    Resend,
}

/// Credential negotiation state for one session.
#[derive(Debug)]
pub struct SessionAuthentication {
    auth_type: AuthType,
    remote_username: String,
    remote_password: String,
    /// Config-supplied nonce for authenticating to the peer, consumed on use.
    remote_nonce_override: Option<Vec<u8>>,
    local_username: String,
    local_password: String,
    /// Config-supplied nonce for verifying the peer, consumed on use.
    local_nonce_override: Option<Vec<u8>>,
    authed_to_remote: bool,
    remote_auth_pending: bool,
    remote_authed: bool,
    local_auth_pending: bool,
    last_error: String,
}

impl SessionAuthentication {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth_type: AuthType,
        remote_username: &str,
        remote_password: &str,
        remote_nonce: Option<Vec<u8>>,
        local_username: &str,
        local_password: &str,
        local_nonce: Option<Vec<u8>>,
    ) -> Self {
        // With no scheme configured both directions start satisfied. Without
        // local credentials we cannot verify the peer, so inbound auth is
        // considered done; outbound still runs if a scheme is set.
        let (authed_to_remote, remote_authed) = if auth_type == AuthType::None {
            (true, true)
        } else if local_username.is_empty() || local_password.is_empty() {
            (false, true)
        } else {
            (false, false)
        };

        SessionAuthentication {
            auth_type,
            remote_username: remote_username.to_string(),
            remote_password: remote_password.to_string(),
            remote_nonce_override: remote_nonce,
            local_username: local_username.to_string(),
            local_password: local_password.to_string(),
            local_nonce_override: local_nonce,
            authed_to_remote,
            remote_auth_pending: false,
            remote_authed,
            local_auth_pending: false,
            last_error: String::new(),
        }
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    /// Whether the peer has authenticated to us (or never had to).
    pub fn remote_is_authed(&self) -> bool {
        self.remote_authed
    }

    /// Whether the peer has accepted our credentials (or never asked).
    pub fn authed_to_remote(&self) -> bool {
        self.authed_to_remote
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Examine inbound header credentials, if any.
    pub async fn analyze_header(
        &mut self,
        header: &HeaderParams,
        db: &Database,
        local_device: &str,
        remote_device: &str,
    ) -> Result<HeaderAuth, PersistError> {
        let Some(cred) = &header.cred else {
            return Ok(HeaderAuth::NotHandled);
        };
        if cred.data.is_empty() {
            return Ok(HeaderAuth::NotHandled);
        }

        if self.remote_authed {
            // Covers re-authentication after success, credentials under a
            // `none` scheme and credentials we cannot verify: we don't do
            // continuous authentication.
            self.last_error = "remote device attempted authentication when not expected".into();
            return Ok(HeaderAuth::Abort);
        }

        self.handle_authentication(cred, db, local_device, remote_device).await
    }

    async fn handle_authentication(
        &mut self,
        cred: &Credentials,
        db: &Database,
        local_device: &str,
        remote_device: &str,
    ) -> Result<HeaderAuth, PersistError> {
        let format = cred.meta.format.as_deref().unwrap_or("");
        if !format.is_empty() && format != FORMAT_ENCODING_B64 && format != FORMAT_ENCODING_BIN {
            self.last_error = format!("unsupported format in Cred: {format}");
            return Ok(HeaderAuth::Abort);
        }
        let b64 = !format.is_empty();

        let cred_type = cred.meta.mime.as_deref().unwrap_or("");

        if cred_type == AUTH_FORMAT_MD5 {
            // A peer offering MD5 always bumps the session to MD5.
            self.auth_type = AuthType::Md5;

            // Peer authenticates to us, so the nonce row is (remote, local).
            let nonces = NonceStore::new(remote_device, local_device);

            let nonce = match self.local_nonce_override.take() {
                Some(nonce) if !nonce.is_empty() => nonce,
                _ => nonces.nonce(db).await?,
            };

            let mut expected = encode_md5_auth(&self.local_username, &self.local_password, &nonce);
            if b64 {
                expected = BASE64.encode(expected).into_bytes();
            }

            if expected == cred.data.as_bytes() {
                debug!("authentication accepted");
                self.local_auth_pending = false;
                self.remote_authed = true;

                let challenge = self.generate_md5_challenge(&nonces, db).await?;
                Ok(HeaderAuth::Handled {
                    status: StatusCode::AuthAccepted,
                    challenge: Some(challenge),
                    abort: false,
                })
            } else if self.local_auth_pending {
                warn!("authentication failed after challenge");
                self.last_error = "authentication failed".into();
                self.local_auth_pending = false;
                self.remote_authed = false;
                Ok(HeaderAuth::Handled {
                    status: StatusCode::InvalidCred,
                    challenge: None,
                    abort: true,
                })
            } else {
                warn!("authentication failed, sending challenge");
                self.local_auth_pending = true;
                self.remote_authed = false;

                let challenge = self.generate_md5_challenge(&nonces, db).await?;
                Ok(HeaderAuth::Handled {
                    status: StatusCode::InvalidCred,
                    challenge: Some(challenge),
                    abort: false,
                })
            }
        } else if cred_type == AUTH_FORMAT_BASIC || cred_type.is_empty() {
            // Unspecified type means basic.
            if self.auth_type == AuthType::Md5 {
                // Basic credentials when MD5 is enforced: challenge once for
                // MD5, fail on repeat.
                if self.local_auth_pending {
                    warn!("authentication failed: basic credentials after MD5 challenge");
                    self.last_error = "authentication failed".into();
                    self.local_auth_pending = false;
                    self.remote_authed = false;
                    Ok(HeaderAuth::Handled {
                        status: StatusCode::InvalidCred,
                        challenge: None,
                        abort: true,
                    })
                } else {
                    warn!("MD5 authentication required, sending challenge");
                    self.local_auth_pending = true;
                    self.remote_authed = false;

                    let nonces = NonceStore::new(remote_device, local_device);
                    let challenge = self.generate_md5_challenge(&nonces, db).await?;
                    Ok(HeaderAuth::Handled {
                        status: StatusCode::InvalidCred,
                        challenge: Some(challenge),
                        abort: false,
                    })
                }
            } else {
                let expected = encode_basic_b64_auth(&self.local_username, &self.local_password);

                if expected == cred.data.as_bytes() {
                    debug!("authentication accepted");
                    self.local_auth_pending = false;
                    self.remote_authed = true;
                    Ok(HeaderAuth::Handled {
                        status: StatusCode::AuthAccepted,
                        challenge: None,
                        abort: false,
                    })
                } else if self.local_auth_pending {
                    warn!("authentication failed after challenge");
                    self.last_error = "authentication failed".into();
                    self.local_auth_pending = false;
                    self.remote_authed = false;
                    Ok(HeaderAuth::Handled {
                        status: StatusCode::InvalidCred,
                        challenge: None,
                        abort: true,
                    })
                } else {
                    warn!("authentication failed, sending challenge");
                    self.local_auth_pending = true;
                    self.remote_authed = false;
                    Ok(HeaderAuth::Handled {
                        status: StatusCode::InvalidCred,
                        challenge: Some(generate_basic_challenge()),
                        abort: false,
                    })
                }
            }
        } else {
            self.last_error = format!("unsupported authentication type encountered: {cred_type}");
            Ok(HeaderAuth::Abort)
        }
    }

    /// Examine the status the peer sent for our header.
    pub async fn analyze_header_status(
        &mut self,
        status: &StatusParams,
        db: &Database,
        local_device: &str,
        remote_device: &str,
    ) -> Result<StatusAuth, PersistError> {
        let Some(code) = status.status_code() else {
            return Ok(StatusAuth::NotHandled);
        };

        if code == StatusCode::Success {
            self.authed_to_remote = true;
            self.remote_auth_pending = false;
            return Ok(StatusAuth::Ok);
        }

        if !matches!(
            code,
            StatusCode::AuthAccepted | StatusCode::InvalidCred | StatusCode::MissingCred
        ) {
            return Ok(StatusAuth::NotHandled);
        }

        // The stored nonce was only valid for this attempt. If the peer
        // supplied a next-nonce it becomes the stored one.
        let nonces = NonceStore::new(local_device, remote_device);
        nonces.clear_nonce(db).await?;

        if let Some(chal) = &status.chal {
            let nonce = decode_nonce(chal);
            if !nonce.is_empty() {
                nonces.set_nonce(db, &nonce).await?;
            }
        }

        if code == StatusCode::AuthAccepted {
            self.authed_to_remote = true;
            self.remote_auth_pending = false;
            return Ok(StatusAuth::Ok);
        }

        // Authentication was rejected.
        self.authed_to_remote = false;

        if self.auth_type == AuthType::None {
            self.last_error = "authentication required".into();
            return Ok(StatusAuth::Abort);
        }

        match &status.chal {
            Some(chal) => {
                let chal = chal.clone();
                self.handle_challenge(&chal, db, local_device, remote_device).await
            }
            None => {
                self.last_error = "authentication failed".into();
                Ok(StatusAuth::Abort)
            }
        }
    }

    /// React to a challenge the peer issued.
    async fn handle_challenge(
        &mut self,
        challenge: &Challenge,
        db: &Database,
        local_device: &str,
        remote_device: &str,
    ) -> Result<StatusAuth, PersistError> {
        let nonces = NonceStore::new(local_device, remote_device);
        let chal_type = challenge.meta.mime.as_deref().unwrap_or("");

        if chal_type == AUTH_FORMAT_MD5 {
            match self.auth_type {
                AuthType::Md5 => {
                    if self.remote_auth_pending {
                        // Our MD5 credentials were already rejected once.
                        self.last_error = "authentication failed".into();
                        Ok(StatusAuth::Abort)
                    } else if nonces.nonce(db).await?.is_empty() {
                        self.last_error =
                            "challenged for MD5 authentication, but do not have a nonce".into();
                        Ok(StatusAuth::Abort)
                    } else {
                        Ok(StatusAuth::Resend)
                    }
                }
                AuthType::Basic => {
                    if nonces.nonce(db).await?.is_empty() {
                        self.last_error =
                            "challenged for MD5 authentication, but do not have a nonce".into();
                        Ok(StatusAuth::Abort)
                    } else {
                        self.auth_type = AuthType::Md5;
                        Ok(StatusAuth::Resend)
                    }
                }
                AuthType::None => {
                    self.last_error = "authentication required".into();
                    Ok(StatusAuth::Abort)
                }
            }
        } else if chal_type == AUTH_FORMAT_BASIC || chal_type.is_empty() {
            if self.remote_auth_pending && self.auth_type == AuthType::Basic {
                // Re-challenge after basic credentials means they were wrong.
                self.last_error = "authentication failed".into();
                Ok(StatusAuth::Abort)
            } else if self.auth_type == AuthType::Md5 {
                // Never revert to a weaker scheme.
                self.last_error =
                    "received basic authentication challenge when MD5 is enforced".into();
                Ok(StatusAuth::Abort)
            } else {
                self.auth_type = AuthType::Basic;
                Ok(StatusAuth::Resend)
            }
        } else {
            self.last_error = format!("unsupported authentication type encountered: {chal_type}");
            Ok(StatusAuth::Abort)
        }
    }

    /// Compose the credentials to attach to our next outgoing header.
    /// Returns `None` when no scheme is configured.
    pub async fn compose_credentials(
        &mut self,
        db: &Database,
        local_device: &str,
        remote_device: &str,
    ) -> Result<Option<Credentials>, PersistError> {
        match self.auth_type {
            AuthType::None => Ok(None),
            AuthType::Basic => {
                self.remote_auth_pending = true;
                let data =
                    BASE64.encode(format!("{}:{}", self.remote_username, self.remote_password));
                Ok(Some(Credentials {
                    data,
                    meta: MetaParams {
                        mime: Some(AUTH_FORMAT_BASIC.to_string()),
                        format: Some(FORMAT_ENCODING_B64.to_string()),
                        ..Default::default()
                    },
                }))
            }
            AuthType::Md5 => {
                let nonce = match self.remote_nonce_override.take() {
                    Some(nonce) if !nonce.is_empty() => nonce,
                    _ => NonceStore::new(local_device, remote_device).nonce(db).await?,
                };

                if nonce.is_empty() {
                    // Authentication will likely fail; leave pending clear so
                    // a peer challenge with a nonce can still rescue us.
                    warn!("MD5 authentication requested but no nonce found");
                } else {
                    self.remote_auth_pending = true;
                }

                let digest = encode_md5_auth(&self.remote_username, &self.remote_password, &nonce);
                Ok(Some(Credentials {
                    data: BASE64.encode(digest),
                    meta: MetaParams {
                        mime: Some(AUTH_FORMAT_MD5.to_string()),
                        format: Some(FORMAT_ENCODING_B64.to_string()),
                        ..Default::default()
                    },
                }))
            }
        }
    }

    /// Challenge a peer that sent no credentials although authentication is
    /// required. MD5 challenges carry (and store) a fresh nonce.
    pub async fn challenge_for_missing_cred(
        &mut self,
        db: &Database,
        local_device: &str,
        remote_device: &str,
    ) -> Result<Option<Challenge>, PersistError> {
        match self.auth_type {
            AuthType::None => Ok(None),
            AuthType::Basic => {
                self.local_auth_pending = true;
                Ok(Some(generate_basic_challenge()))
            }
            AuthType::Md5 => {
                self.local_auth_pending = true;
                let nonces = NonceStore::new(remote_device, local_device);
                Ok(Some(self.generate_md5_challenge(&nonces, db).await?))
            }
        }
    }

    async fn generate_md5_challenge(
        &mut self,
        nonces: &NonceStore,
        db: &Database,
    ) -> Result<Challenge, PersistError> {
        let nonce = match self.local_nonce_override.take() {
            Some(nonce) if !nonce.is_empty() => nonce,
            _ => NonceStore::generate_nonce(),
        };

        nonces.set_nonce(db, &nonce).await?;

        Ok(Challenge {
            meta: MetaParams {
                mime: Some(AUTH_FORMAT_MD5.to_string()),
                format: Some(FORMAT_ENCODING_B64.to_string()),
                next_nonce: Some(BASE64.encode(&nonce)),
                ..Default::default()
            },
        })
    }
}

/// `MD5( MD5(user ":" password) ":" nonce )`, raw 16-byte digest.
pub fn encode_md5_auth(username: &str, password: &str, nonce: &[u8]) -> Vec<u8> {
    let inner = Md5::digest(format!("{username}:{password}").as_bytes());
    let mut outer = Md5::new();
    outer.update(inner);
    outer.update(b":");
    outer.update(nonce);
    outer.finalize().to_vec()
}

/// `base64(user ":" password)` as bytes.
pub fn encode_basic_b64_auth(username: &str, password: &str) -> Vec<u8> {
    BASE64.encode(format!("{username}:{password}")).into_bytes()
}

/// Decode a NextNonce from a challenge, honoring its declared format.
pub fn decode_nonce(challenge: &Challenge) -> Vec<u8> {
    let Some(next_nonce) = &challenge.meta.next_nonce else {
        return Vec::new();
    };

    match challenge.meta.format.as_deref() {
        Some(FORMAT_ENCODING_B64) | Some(FORMAT_ENCODING_BIN) => {
            BASE64.decode(next_nonce.as_bytes()).unwrap_or_default()
        }
        None | Some("") => next_nonce.clone().into_bytes(),
        Some(format) => {
            warn!(format = %format, "unknown format specified for NextNonce, ignoring");
            Vec::new()
        }
    }
}

fn generate_basic_challenge() -> Challenge {
    Challenge {
        meta: MetaParams {
            mime: Some(AUTH_FORMAT_BASIC.to_string()),
            format: Some(FORMAT_ENCODING_B64.to_string()),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::StatusCode;

    async fn test_db() -> (tempfile::TempDir, Database) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("state.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        (tmp, db)
    }

    fn md5_header(user: &str, pass: &str, nonce: &[u8]) -> HeaderParams {
        HeaderParams {
            cred: Some(Credentials {
                data: BASE64.encode(encode_md5_auth(user, pass, nonce)),
                meta: MetaParams {
                    mime: Some(AUTH_FORMAT_MD5.to_string()),
                    format: Some(FORMAT_ENCODING_B64.to_string()),
                    ..Default::default()
                },
            }),
            ..Default::default()
        }
    }

    fn basic_header(user: &str, pass: &str) -> HeaderParams {
        HeaderParams {
            cred: Some(Credentials {
                data: String::from_utf8(encode_basic_b64_auth(user, pass)).unwrap(),
                meta: MetaParams {
                    mime: Some(AUTH_FORMAT_BASIC.to_string()),
                    ..Default::default()
                },
            }),
            ..Default::default()
        }
    }

    fn auth(auth_type: AuthType) -> SessionAuthentication {
        SessionAuthentication::new(auth_type, "u", "p", None, "u", "p", None)
    }

    // ---- MD5 digest shape ----

    #[test]
    fn md5_digest_is_deterministic_and_nonce_bound() {
        let one = encode_md5_auth("u", "p", b"nonce");
        let two = encode_md5_auth("u", "p", b"nonce");
        let other = encode_md5_auth("u", "p", b"other");
        assert_eq!(one.len(), 16);
        assert_eq!(one, two);
        assert_ne!(one, other);
    }

    #[test]
    fn basic_encoding_matches_rfc_shape() {
        assert_eq!(encode_basic_b64_auth("user", "pw"), b"dXNlcjpwdw==".to_vec());
    }

    // ---- inbound basic ----

    #[tokio::test]
    async fn basic_accept() {
        let (_tmp, db) = test_db().await;
        let mut auth = auth(AuthType::Basic);

        let result = auth
            .analyze_header(&basic_header("u", "p"), &db, "local", "remote")
            .await
            .unwrap();
        assert_eq!(
            result,
            HeaderAuth::Handled { status: StatusCode::AuthAccepted, challenge: None, abort: false }
        );
        assert!(auth.remote_is_authed());
    }

    #[tokio::test]
    async fn basic_reject_challenges_then_aborts() {
        let (_tmp, db) = test_db().await;
        let mut auth = auth(AuthType::Basic);

        let first = auth
            .analyze_header(&basic_header("u", "wrong"), &db, "local", "remote")
            .await
            .unwrap();
        match first {
            HeaderAuth::Handled { status, challenge, abort } => {
                assert_eq!(status, StatusCode::InvalidCred);
                assert!(challenge.is_some());
                assert!(!abort);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let second = auth
            .analyze_header(&basic_header("u", "wrong"), &db, "local", "remote")
            .await
            .unwrap();
        match second {
            HeaderAuth::Handled { status, challenge, abort } => {
                assert_eq!(status, StatusCode::InvalidCred);
                assert!(challenge.is_none());
                assert!(abort);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!auth.remote_is_authed());
    }

    // ---- inbound MD5 ----

    #[tokio::test]
    async fn md5_accept_issues_next_nonce() {
        let (_tmp, db) = test_db().await;

        // The nonce previously issued to the peer; keyed (remote, local)
        // because the peer is the authenticating side.
        NonceStore::new("remote", "local").set_nonce(&db, b"N0").await.unwrap();

        let mut auth = auth(AuthType::Md5);
        let result = auth
            .analyze_header(&md5_header("u", "p", b"N0"), &db, "local", "remote")
            .await
            .unwrap();

        let HeaderAuth::Handled { status, challenge, abort } = result else {
            panic!("expected handled result");
        };
        assert_eq!(status, StatusCode::AuthAccepted);
        assert!(!abort);

        // The challenge carries a fresh next-nonce, which is now stored.
        let chal = challenge.expect("challenge with next nonce");
        let next = decode_nonce(&chal);
        assert!(!next.is_empty());
        assert_ne!(next, b"N0".to_vec());
        let stored = NonceStore::new("remote", "local").nonce(&db).await.unwrap();
        assert_eq!(stored, next);
    }

    #[tokio::test]
    async fn md5_with_wrong_nonce_is_challenged() {
        let (_tmp, db) = test_db().await;
        NonceStore::new("remote", "local").set_nonce(&db, b"N0").await.unwrap();

        let mut auth = auth(AuthType::Md5);
        let result = auth
            .analyze_header(&md5_header("u", "p", b"stale"), &db, "local", "remote")
            .await
            .unwrap();

        let HeaderAuth::Handled { status, challenge, abort } = result else {
            panic!("expected handled result");
        };
        assert_eq!(status, StatusCode::InvalidCred);
        assert!(challenge.is_some());
        assert!(!abort);
    }

    #[tokio::test]
    async fn basic_credentials_bump_to_md5_challenge_when_md5_enforced() {
        let (_tmp, db) = test_db().await;
        let mut auth = auth(AuthType::Md5);

        let result = auth
            .analyze_header(&basic_header("u", "p"), &db, "local", "remote")
            .await
            .unwrap();
        let HeaderAuth::Handled { status, challenge, abort } = result else {
            panic!("expected handled result");
        };
        assert_eq!(status, StatusCode::InvalidCred);
        assert!(!abort);
        let chal = challenge.expect("MD5 challenge");
        assert_eq!(chal.meta.mime.as_deref(), Some(AUTH_FORMAT_MD5));
    }

    #[tokio::test]
    async fn reauthentication_after_success_aborts() {
        let (_tmp, db) = test_db().await;
        let mut auth = auth(AuthType::Basic);

        auth.analyze_header(&basic_header("u", "p"), &db, "local", "remote").await.unwrap();
        let result = auth
            .analyze_header(&basic_header("u", "p"), &db, "local", "remote")
            .await
            .unwrap();
        assert_eq!(result, HeaderAuth::Abort);
    }

    // ---- outbound status handling ----

    fn status_with(code: StatusCode, chal: Option<Challenge>) -> StatusParams {
        StatusParams {
            cmd_id: 1,
            msg_ref: 1,
            cmd_ref: 0,
            cmd: "SyncHdr".into(),
            target_ref: None,
            source_ref: None,
            code: code.as_u16(),
            next_anchor: None,
            items: vec![],
            chal,
        }
    }

    #[tokio::test]
    async fn auth_accepted_stores_next_nonce() {
        let (_tmp, db) = test_db().await;
        let mut auth = auth(AuthType::Md5);

        let chal = Challenge {
            meta: MetaParams {
                mime: Some(AUTH_FORMAT_MD5.to_string()),
                format: Some(FORMAT_ENCODING_B64.to_string()),
                next_nonce: Some(BASE64.encode(b"N1")),
                ..Default::default()
            },
        };

        let result = auth
            .analyze_header_status(&status_with(StatusCode::AuthAccepted, Some(chal)), &db, "local", "remote")
            .await
            .unwrap();
        assert_eq!(result, StatusAuth::Ok);
        assert!(auth.authed_to_remote());

        let stored = NonceStore::new("local", "remote").nonce(&db).await.unwrap();
        assert_eq!(stored, b"N1");
    }

    #[tokio::test]
    async fn md5_challenge_without_nonce_aborts() {
        let (_tmp, db) = test_db().await;
        let mut auth = auth(AuthType::Md5);

        let chal = Challenge {
            meta: MetaParams {
                mime: Some(AUTH_FORMAT_MD5.to_string()),
                ..Default::default()
            },
        };

        let result = auth
            .analyze_header_status(&status_with(StatusCode::InvalidCred, Some(chal)), &db, "local", "remote")
            .await
            .unwrap();
        assert_eq!(result, StatusAuth::Abort);
        assert!(auth.last_error().contains("nonce"));
    }

    #[tokio::test]
    async fn md5_challenge_with_nonce_resends() {
        let (_tmp, db) = test_db().await;
        let mut auth = auth(AuthType::Md5);

        let chal = Challenge {
            meta: MetaParams {
                mime: Some(AUTH_FORMAT_MD5.to_string()),
                format: Some(FORMAT_ENCODING_B64.to_string()),
                next_nonce: Some(BASE64.encode(b"N1")),
                ..Default::default()
            },
        };

        let result = auth
            .analyze_header_status(&status_with(StatusCode::InvalidCred, Some(chal)), &db, "local", "remote")
            .await
            .unwrap();
        assert_eq!(result, StatusAuth::Resend);
    }

    #[tokio::test]
    async fn basic_challenge_when_md5_enforced_aborts() {
        let (_tmp, db) = test_db().await;
        let mut auth = auth(AuthType::Md5);

        let chal = Challenge {
            meta: MetaParams {
                mime: Some(AUTH_FORMAT_BASIC.to_string()),
                ..Default::default()
            },
        };

        let result = auth
            .analyze_header_status(&status_with(StatusCode::InvalidCred, Some(chal)), &db, "local", "remote")
            .await
            .unwrap();
        assert_eq!(result, StatusAuth::Abort);
        assert!(auth.last_error().contains("MD5 is enforced"));
    }

    // ---- composing credentials ----

    #[tokio::test]
    async fn compose_md5_uses_stored_nonce() {
        let (_tmp, db) = test_db().await;
        NonceStore::new("local", "remote").set_nonce(&db, b"N1").await.unwrap();

        let mut auth = auth(AuthType::Md5);
        let cred = auth
            .compose_credentials(&db, "local", "remote")
            .await
            .unwrap()
            .expect("md5 credentials");

        assert_eq!(cred.meta.mime.as_deref(), Some(AUTH_FORMAT_MD5));
        assert_eq!(cred.data, BASE64.encode(encode_md5_auth("u", "p", b"N1")));
    }

    #[tokio::test]
    async fn compose_none_yields_nothing() {
        let (_tmp, db) = test_db().await;
        let mut auth = auth(AuthType::None);
        assert!(auth.compose_credentials(&db, "local", "remote").await.unwrap().is_none());
    }
}
