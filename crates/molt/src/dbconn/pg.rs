//! Postgres-wire connections (upstream PostgreSQL and CockroachDB).

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{pin_mut, SinkExt};
use rustls::ClientConfig;
use tokio_postgres::{Client, Config as PgConfig, SimpleQueryMessage};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use super::{RawRow, TypeMap};
use crate::error::{MoltError, Result};

/// A single Postgres-wire connection.
pub struct PgConn {
    id: String,
    conn_str: String,
    client: Client,
    handle: tokio::task::JoinHandle<()>,
    is_cockroach: bool,
    type_map: Arc<TypeMap>,
}

impl PgConn {
    /// Connect and detect whether the server is CockroachDB. When
    /// `type_map` is given (cloning), the new connection shares it.
    pub async fn connect(id: &str, conn_str: &str, type_map: Option<Arc<TypeMap>>) -> Result<Self> {
        let config = PgConfig::from_str(conn_str)?;
        let ssl_mode = sslmode_param(conn_str);

        let (client, handle) = match ssl_mode.as_str() {
            "disable" => {
                let (client, connection) = config.connect(tokio_postgres::NoTls).await?;
                let handle = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(error = %e, "postgres connection closed");
                    }
                });
                (client, handle)
            }
            mode => {
                let tls = MakeRustlsConnect::new(build_tls_config(mode)?);
                let (client, connection) = config.connect(tls).await?;
                let handle = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(error = %e, "postgres connection closed");
                    }
                });
                (client, handle)
            }
        };

        let mut conn = Self {
            id: id.to_string(),
            conn_str: conn_str.to_string(),
            client,
            handle,
            is_cockroach: false,
            type_map: type_map.unwrap_or_default(),
        };
        let version = conn
            .query_one_string("SELECT version()")
            .await?
            .unwrap_or_default();
        conn.is_cockroach = version.contains("CockroachDB");
        Ok(conn)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conn_str(&self) -> &str {
        &self.conn_str
    }

    pub fn is_cockroach(&self) -> bool {
        self.is_cockroach
    }

    pub fn type_map(&self) -> &Arc<TypeMap> {
        &self.type_map
    }

    pub async fn clone_conn(&self) -> Result<Self> {
        Self::connect(&self.id, &self.conn_str, Some(self.type_map.clone())).await
    }

    pub async fn execute(&self, sql: &str) -> Result<u64> {
        Ok(self.client.execute(sql, &[]).await?)
    }

    /// Run a query via the simple protocol, which returns every cell in
    /// text format regardless of its type.
    pub async fn query(&self, sql: &str) -> Result<Vec<RawRow>> {
        let messages = self.client.simple_query(sql).await?;
        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let mut cells = Vec::with_capacity(row.len());
                for i in 0..row.len() {
                    cells.push(row.get(i).map(|s| s.to_string()));
                }
                rows.push(cells);
            }
        }
        Ok(rows)
    }

    /// First cell of the first row, if any.
    pub async fn query_one_string(&self, sql: &str) -> Result<Option<String>> {
        Ok(self
            .query(sql)
            .await?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .flatten())
    }

    /// Stream `data` into a `COPY ... FROM STDIN` statement.
    pub async fn copy_from(&self, stmt: &str, data: Vec<u8>) -> Result<u64> {
        let sink = self.client.copy_in(stmt).await?;
        pin_mut!(sink);
        sink.send(Bytes::from(data))
            .await
            .map_err(MoltError::Postgres)?;
        Ok(sink.finish().await?)
    }

    pub async fn close(self) -> Result<()> {
        drop(self.client);
        self.handle.abort();
        Ok(())
    }
}

fn sslmode_param(conn_str: &str) -> String {
    url::Url::parse(conn_str)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "sslmode")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or_else(|| "prefer".to_string())
}

/// Build the rustls client configuration for the requested `sslmode`.
fn build_tls_config(ssl_mode: &str) -> Result<ClientConfig> {
    let config = match ssl_mode {
        "verify-ca" | "verify-full" => {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
        "require" | "prefer" | "allow" => {
            warn!(
                ssl_mode,
                "TLS enabled but server certificate is not verified"
            );
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        }
        other => {
            return Err(MoltError::Config(format!(
                "unsupported sslmode {:?}",
                other
            )))
        }
    };
    Ok(config)
}

/// Certificate verifier that accepts any server certificate, for
/// `sslmode=require` semantics.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
