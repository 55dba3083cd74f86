//! SASL mechanisms: PLAIN and SCRAM-SHA256/512

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

use crate::utils::ConnectionError;

/// Username and password used for SASL
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// keep passwords out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::ScramSha256 => "SCRAM-SHA256",
            Mechanism::ScramSha512 => "SCRAM-SHA512",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "PLAIN" => Some(Mechanism::Plain),
            "SCRAM-SHA256" => Some(Mechanism::ScramSha256),
            "SCRAM-SHA512" => Some(Mechanism::ScramSha512),
            _ => None,
        }
    }

    /// Pick a mechanism from the server's list.
    ///
    /// Over TLS the channel already protects the password, so PLAIN is
    /// preferred; otherwise the strongest SCRAM variant offered wins.
    pub fn select(offered: &[String], use_tls: bool) -> Option<Self> {
        let offered: Vec<Mechanism> = offered.iter().filter_map(|m| Self::from_name(m)).collect();
        if use_tls && offered.contains(&Mechanism::Plain) {
            return Some(Mechanism::Plain);
        }
        [Mechanism::ScramSha512, Mechanism::ScramSha256, Mechanism::Plain]
            .into_iter()
            .find(|m| offered.contains(m))
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// PLAIN payload: `\0user\0password`
pub fn plain_payload(credentials: &Credentials) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(credentials.username.len() + credentials.password.len() + 2);
    payload.push(0);
    payload.extend_from_slice(credentials.username.as_bytes());
    payload.push(0);
    payload.extend_from_slice(credentials.password.as_bytes());
    payload
}

/// Client side of a SCRAM exchange (RFC 5802, no channel binding)
pub struct ScramClient {
    mechanism: Mechanism,
    password: String,
    nonce: String,
    client_first_bare: String,
    server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(mechanism: Mechanism, credentials: &Credentials) -> Self {
        let nonce: String = std::iter::repeat_with(fastrand::alphanumeric)
            .take(24)
            .collect();
        Self::with_nonce(mechanism, credentials, nonce)
    }

    pub fn with_nonce(mechanism: Mechanism, credentials: &Credentials, nonce: String) -> Self {
        let client_first_bare = format!("n={},r={}", escape_username(&credentials.username), nonce);
        Self {
            mechanism,
            password: credentials.password.clone(),
            nonce,
            client_first_bare,
            server_signature: None,
        }
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// First message, sent with `SaslAuth`
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Answer the server-first challenge; the result is sent with `SaslStep`
    pub fn client_final(&mut self, server_first: &str) -> Result<String, ConnectionError> {
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => server_nonce = Some(v),
                Some(("s", v)) => salt = Some(v),
                Some(("i", v)) => iterations = v.parse::<u32>().ok(),
                _ => {}
            }
        }

        let (Some(server_nonce), Some(salt), Some(iterations)) = (server_nonce, salt, iterations)
        else {
            return Err(ConnectionError::AuthFailed(format!(
                "malformed SCRAM challenge: {}",
                server_first
            )));
        };
        if !server_nonce.starts_with(&self.nonce) || iterations == 0 {
            return Err(ConnectionError::AuthFailed(
                "SCRAM challenge failed nonce or iteration check".to_string(),
            ));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|e| ConnectionError::AuthFailed(format!("invalid SCRAM salt: {}", e)))?;

        let without_proof = format!("c=biws,r={}", server_nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);

        let salted = self.hi(self.password.as_bytes(), &salt, iterations)?;
        let client_key = self.hmac(&salted, b"Client Key")?;
        let stored_key = self.hash(&client_key);
        let client_signature = self.hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = self.hmac(&salted, b"Server Key")?;
        self.server_signature = Some(self.hmac(&server_key, auth_message.as_bytes())?);

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Check the server's final message proves it knows the password too
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), ConnectionError> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ConnectionError::AuthFailed(format!("server rejected SCRAM: {}", err)));
        }
        let verifier = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| ConnectionError::AuthFailed("missing server signature".to_string()))?;
        let received = BASE64
            .decode(verifier)
            .map_err(|e| ConnectionError::AuthFailed(format!("invalid server signature: {}", e)))?;

        match &self.server_signature {
            Some(expected) if *expected == received => Ok(()),
            Some(_) => Err(ConnectionError::AuthFailed(
                "server signature mismatch".to_string(),
            )),
            None => Err(ConnectionError::AuthFailed(
                "server final received before challenge".to_string(),
            )),
        }
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let invalid = |e: hmac::digest::InvalidLength| ConnectionError::AuthFailed(e.to_string());
        Ok(match self.mechanism {
            Mechanism::ScramSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(invalid)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            _ => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(invalid)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self.mechanism {
            Mechanism::ScramSha512 => Sha512::digest(data).to_vec(),
            _ => Sha256::digest(data).to_vec(),
        }
    }

    /// PBKDF2 with the mechanism's HMAC, one output block
    fn hi(&self, password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, ConnectionError> {
        let mut block = salt.to_vec();
        block.extend_from_slice(&1u32.to_be_bytes());
        let mut u = self.hmac(password, &block)?;
        let mut result = u.clone();
        for _ in 1..iterations {
            u = self.hmac(password, &u)?;
            for (r, b) in result.iter_mut().zip(u.iter()) {
                *r ^= b;
            }
        }
        Ok(result)
    }
}

fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_mechanism() {
        let all = names(&["SCRAM-SHA512", "SCRAM-SHA256", "SCRAM-SHA1", "PLAIN"]);
        assert_eq!(Mechanism::select(&all, false), Some(Mechanism::ScramSha512));
        assert_eq!(Mechanism::select(&all, true), Some(Mechanism::Plain));
        assert_eq!(
            Mechanism::select(&names(&["SCRAM-SHA256", "PLAIN"]), false),
            Some(Mechanism::ScramSha256)
        );
        assert_eq!(Mechanism::select(&names(&["PLAIN"]), false), Some(Mechanism::Plain));
        assert_eq!(Mechanism::select(&names(&["CRAM-MD5"]), false), None);
    }

    #[test]
    fn test_plain_payload() {
        let creds = Credentials::new("admin", "secret");
        assert_eq!(plain_payload(&creds), b"\0admin\0secret".to_vec());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("admin", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_scram_sha256_rfc7677_vector() {
        let creds = Credentials::new("user", "pencil");
        let mut client =
            ScramClient::with_nonce(Mechanism::ScramSha256, &creds, "rOprNGfwEbeRWgbNEkqO".into());
        assert_eq!(client.client_first(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let server_first =
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let client_final = client.client_final(server_first).unwrap();
        assert_eq!(
            client_final,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        client
            .verify_server_final("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
        assert!(client.verify_server_final("v=AAAA").is_err());
    }

    #[test]
    fn test_scram_rejects_foreign_nonce() {
        let creds = Credentials::new("user", "pencil");
        let mut client = ScramClient::with_nonce(Mechanism::ScramSha512, &creds, "abc".into());
        assert!(client.client_final("r=zzz,s=AAAA,i=4096").is_err());
        assert!(client.client_final("garbage").is_err());
    }

    #[test]
    fn test_username_escaping() {
        assert_eq!(escape_username("a=b,c"), "a=3Db=2Cc");
    }
}
