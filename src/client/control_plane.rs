//! Control plane trait for node communication
//!
//! `ControlPlane` is the seam between the handshake / config logic and the
//! transport: anything that can execute an [`Operation`] gets the handshake
//! steps and config fetches from the blanket [`ControlPlaneExt`] impl.
//!
//! Implementations:
//! - `NodeConnection`: one pipelined TCP/TLS connection
//! - `ClusterNode`: a connection handle that reconnects on demand

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::sasl::{plain_payload, Credentials, Mechanism, ScramClient};
use crate::ops::{
    ErrorMap, HelloFeature, Operation, OperationResponse, ServerFeatures, Status,
};
use crate::utils::{ClientError, ConnectionError, KvError, Result};

/// Execute operations against one node
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Send an operation and wait for its matched response
    async fn execute(&self, op: &mut Operation) -> Result<OperationResponse>;
}

/// Handshake and config operations built on [`ControlPlane::execute`]
#[async_trait]
pub trait ControlPlaneExt: ControlPlane {
    /// Round-trip a NOOP
    async fn noop(&self) -> Result<()> {
        self.execute(&mut Operation::noop()).await.map(|_| ())
    }

    /// HELLO: returns the subset of `features` the server accepted
    async fn hello(&self, user_agent: &str, features: &[HelloFeature]) -> Result<ServerFeatures> {
        let response = self
            .execute(&mut Operation::hello(user_agent, features))
            .await
            .map_err(|e| ConnectionError::Negotiation(format!("HELLO failed: {}", e)))?;

        let accepted = response
            .value
            .chunks_exact(2)
            .filter_map(|c| HelloFeature::from_u16(u16::from_be_bytes([c[0], c[1]])))
            .collect();
        Ok(ServerFeatures::new(accepted))
    }

    /// Fetch and parse the server error map
    async fn get_error_map(&self, version: u16) -> Result<ErrorMap> {
        let response = self
            .execute(&mut Operation::get_error_map(version))
            .await
            .map_err(|e| ConnectionError::Negotiation(format!("GetErrorMap failed: {}", e)))?;
        ErrorMap::parse(&response.value)
            .map_err(|e| ConnectionError::Negotiation(format!("invalid error map: {}", e)).into())
    }

    /// Mechanisms the server offers, as listed in its space-separated reply
    async fn sasl_list_mechs(&self) -> Result<Vec<String>> {
        let response = self
            .execute(&mut Operation::sasl_list_mechs())
            .await
            .map_err(auth_error)?;
        let list = String::from_utf8_lossy(&response.value);
        Ok(list.split_whitespace().map(String::from).collect())
    }

    /// Run SASL authentication with the best mechanism for this transport
    async fn authenticate(&self, credentials: &Credentials, use_tls: bool) -> Result<Mechanism> {
        let offered = self.sasl_list_mechs().await?;
        let mechanism = Mechanism::select(&offered, use_tls).ok_or_else(|| {
            ConnectionError::AuthFailed(format!("no supported SASL mechanism in {:?}", offered))
        })?;
        debug!("Authenticating as {} using {}", credentials.username, mechanism);

        match mechanism {
            Mechanism::Plain => {
                let mut op = Operation::sasl_auth(mechanism.name(), plain_payload(credentials));
                let response = self.execute(&mut op).await.map_err(auth_error)?;
                if response.status != Status::Success {
                    return Err(ConnectionError::AuthFailed(format!(
                        "PLAIN ended with {}",
                        response.status
                    ))
                    .into());
                }
            }
            Mechanism::ScramSha256 | Mechanism::ScramSha512 => {
                let mut scram = ScramClient::new(mechanism, credentials);
                let mut op = Operation::sasl_auth(mechanism.name(), scram.client_first());
                let challenge = self.execute(&mut op).await.map_err(auth_error)?;
                if challenge.status != Status::AuthContinue {
                    return Err(ConnectionError::AuthFailed(format!(
                        "expected SCRAM challenge, got {}",
                        challenge.status
                    ))
                    .into());
                }

                let server_first = String::from_utf8_lossy(&challenge.value).into_owned();
                let client_final = scram.client_final(&server_first)?;
                let mut op = Operation::sasl_step(mechanism.name(), client_final);
                let outcome = self.execute(&mut op).await.map_err(auth_error)?;
                scram.verify_server_final(&String::from_utf8_lossy(&outcome.value))?;
            }
        }
        Ok(mechanism)
    }

    /// Bind the connection to a bucket
    async fn select_bucket(&self, bucket: &str) -> Result<()> {
        match self.execute(&mut Operation::select_bucket(bucket)).await {
            Ok(_) => Ok(()),
            Err(ClientError::Kv(
                kv @ (KvError::DocumentNotFound | KvError::AccessDenied | KvError::NoBucket),
            )) => Err(ConnectionError::SelectBucketFailed {
                bucket: bucket.to_string(),
                reason: kv.to_string(),
            }
            .into()),
            Err(e) => Err(e),
        }
    }

    /// Current config known to this node, or `None` when the node cannot
    /// serve one (no bucket selected, or an older server without CCCP)
    async fn get_cluster_config(&self) -> Result<Option<Bytes>> {
        match self.execute(&mut Operation::get_cluster_config()).await {
            Ok(response) => Ok(Some(response.value)),
            Err(ClientError::Kv(KvError::NoBucket | KvError::NotSupported(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Raw collections manifest JSON of the selected bucket
    async fn get_collections_manifest(&self) -> Result<Bytes> {
        let response = self
            .execute(&mut Operation::get_collections_manifest())
            .await?;
        Ok(response.value)
    }
}

// Blanket implementation: any ControlPlane automatically gets ControlPlaneExt
impl<T: ControlPlane + ?Sized> ControlPlaneExt for T {}

fn auth_error(err: ClientError) -> ClientError {
    match err {
        ClientError::Kv(KvError::AuthenticationFailed | KvError::AccessDenied) => {
            ConnectionError::AuthFailed("invalid credentials".to_string()).into()
        }
        ClientError::Kv(other) => ConnectionError::AuthFailed(other.to_string()).into(),
        other => other,
    }
}
