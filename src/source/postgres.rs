// pgvault/src/source/postgres.rs
use async_trait::async_trait;
use futures::stream::BoxStream;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgSslMode};
use sqlx::{Connection, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ByteStream, ConnectionCheck, ConnectionDescriptor, Connector, DataSource, TlsMode};
use crate::catalog::{DatabaseObject, queries};
use crate::errors::{BackupError, Result};
use crate::export::{FormatOptions, ObjectExporter};

#[derive(Debug, Clone, Copy)]
pub struct PgConnectorOptions {
    /// Upper bound on pooled connections for one run. Should cover the
    /// run's task concurrency plus one for catalog queries.
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for PgConnectorOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    options: PgConnectorOptions,
}

fn ssl_mode(mode: TlsMode) -> PgSslMode {
    match mode {
        TlsMode::Disable => PgSslMode::Disable,
        TlsMode::Allow => PgSslMode::Allow,
        TlsMode::Prefer => PgSslMode::Prefer,
        TlsMode::Require => PgSslMode::Require,
        TlsMode::VerifyCa => PgSslMode::VerifyCa,
        TlsMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

impl PgConnector {
    pub fn new(options: PgConnectorOptions) -> Self {
        Self { options }
    }

    fn connect_options(descriptor: &ConnectionDescriptor) -> PgConnectOptions {
        let mut opts = PgConnectOptions::new()
            .host(&descriptor.host)
            .port(descriptor.port)
            .database(&descriptor.database)
            .username(&descriptor.username)
            .application_name("pgvault");
        if !descriptor.secret.is_empty() {
            opts = opts.password(descriptor.secret.expose());
        }
        if let Some(tls) = descriptor.tls {
            opts = opts.ssl_mode(ssl_mode(tls));
        }
        opts
    }

    fn timeout_message(&self, descriptor: &ConnectionDescriptor) -> String {
        format!(
            "timed out after {}s connecting to {}",
            self.options.connect_timeout.as_secs(),
            descriptor.key()
        )
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn DataSource>> {
        debug!(target_db = %descriptor.key(), "opening connection pool");
        let connecting = PgPoolOptions::new()
            .max_connections(self.options.max_connections.max(1))
            .acquire_timeout(self.options.connect_timeout)
            .connect_with(Self::connect_options(descriptor));

        let pool = match tokio::time::timeout(self.options.connect_timeout, connecting).await {
            Ok(Ok(pool)) => pool,
            // Anything that goes wrong before the first connection is up is a
            // connection problem, including rejected credentials.
            Ok(Err(e)) => {
                return Err(BackupError::Connection(format!(
                    "failed to connect to {}: {}",
                    descriptor.key(),
                    e
                )));
            }
            Err(_) => return Err(BackupError::Connection(self.timeout_message(descriptor))),
        };
        info!(target_db = %descriptor.key(), "connected");
        Ok(Arc::new(PgSource { pool }))
    }

    async fn test_connection(&self, descriptor: &ConnectionDescriptor) -> ConnectionCheck {
        let opts = Self::connect_options(descriptor);
        let mut conn = match tokio::time::timeout(self.options.connect_timeout, PgConnection::connect_with(&opts)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return ConnectionCheck::failed(format!("Failed to connect to database: {}", e)),
            Err(_) => return ConnectionCheck::failed(self.timeout_message(descriptor)),
        };

        let version: std::result::Result<String, sqlx::Error> =
            sqlx::query_scalar("SHOW server_version").fetch_one(&mut conn).await;
        let check = match version {
            Ok(version) => ConnectionCheck::ok(format!("Connection successful! PostgreSQL {}", version)),
            Err(e) => ConnectionCheck::failed(format!("Connected but the server did not answer: {}", e)),
        };
        if let Err(e) = conn.close().await {
            warn!(error = %e, "error closing test connection");
        }
        check
    }
}

/// A pooled handle on one database. Exports share the pool but never a
/// connection, so concurrent tasks run concurrent queries.
pub struct PgSource {
    pool: PgPool,
}

#[async_trait]
impl DataSource for PgSource {
    fn list_objects(&self) -> BoxStream<'static, Result<DatabaseObject>> {
        queries::stream_objects(self.pool.clone())
    }

    async fn open_export(&self, object: &DatabaseObject, options: &FormatOptions) -> Result<ByteStream> {
        Ok(ObjectExporter::for_object(object).open(self.pool.clone(), *options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::source::Secret;

    fn closed_port() -> ConnectionDescriptor {
        // Port 1 is reserved and nothing listens on it in test environments.
        let mut desc = ConnectionDescriptor::new("127.0.0.1", 1, "app", "backup", Secret::new("pw"));
        desc.tls = Some(TlsMode::Disable);
        desc
    }

    fn connector() -> PgConnector {
        PgConnector::new(PgConnectorOptions {
            max_connections: 1,
            connect_timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_connection_error() {
        let result = connector().connect(&closed_port()).await;
        assert!(matches!(result.map(|_| ()), Err(e) if e.kind() == ErrorKind::Connection));
    }

    #[tokio::test]
    async fn test_connection_check_reports_failure() {
        let check = connector().test_connection(&closed_port()).await;
        assert!(!check.success);
        assert!(!check.message.contains("pw"));
    }

    #[test]
    fn test_ssl_mode_mapping() {
        assert!(matches!(ssl_mode(TlsMode::VerifyFull), PgSslMode::VerifyFull));
        assert!(matches!(ssl_mode(TlsMode::Disable), PgSslMode::Disable));
    }
}
