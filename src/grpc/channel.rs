use tonic::transport::{Channel, Endpoint};

use crate::error::Result;
use crate::proto::cluster_manager_client::ClusterManagerClient;
use crate::tls::TlsIdentity;

/// Normalize a manager address into a URI, adding a scheme matching the
/// TLS setting when none is given.
pub fn manager_uri(addr: &str, tls: bool) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else if tls {
        format!("https://{}", addr)
    } else {
        format!("http://{}", addr)
    }
}

/// Open the channel to the cluster manager, with mTLS if an identity is given.
pub async fn connect_manager(addr: &str, tls_identity: Option<&TlsIdentity>) -> Result<Channel> {
    let uri = manager_uri(addr, tls_identity.is_some());
    let endpoint = Endpoint::from_shared(uri.clone())?;

    let endpoint = match tls_identity {
        Some(identity) => endpoint.tls_config(identity.client_tls_config())?,
        None => endpoint,
    };

    tracing::info!(uri = %uri, tls = tls_identity.is_some(), "Connecting to cluster manager");
    Ok(endpoint.connect().await?)
}

pub async fn manager_client(
    addr: &str,
    tls_identity: Option<&TlsIdentity>,
) -> Result<(Channel, ClusterManagerClient<Channel>)> {
    let channel = connect_manager(addr, tls_identity).await?;
    Ok((channel.clone(), ClusterManagerClient::new(channel)))
}
