//! TCP listener: binds the configured address, accepts connections, and
//! spawns one session task per connection. Certificate material, when
//! configured, is loaded once here and shared with every session.

use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig as RustlsConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::logger::Logger;
use crate::session::Session;
use crate::storage::MessageStore;

pub struct SmtpServer {
    config: Arc<Config>,
    store: Arc<dyn MessageStore>,
    logger: Logger,
    tls_acceptor: Option<TlsAcceptor>,
}

impl SmtpServer {
    /// A certificate that fails to load degrades the server to
    /// plaintext-only (no STARTTLS offered) instead of aborting.
    pub fn new(config: Arc<Config>, store: Arc<dyn MessageStore>, logger: Logger) -> Self {
        let tls_acceptor = match load_tls_acceptor(&config) {
            Ok(Some(acceptor)) => {
                logger.info("TLS certificates loaded successfully");
                Some(acceptor)
            }
            Ok(None) => None,
            Err(e) => {
                logger.warn(format!("Failed to load TLS certificates: {:#}", e));
                None
            }
        };

        Self {
            config,
            store,
            logger,
            tls_acceptor,
        }
    }

    /// Binds the configured address and serves forever. Binding failure is
    /// fatal and propagates; accept failures are logged and skipped.
    pub async fn listen(&self) -> Result<()> {
        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;

        self.serve(listener).await
    }

    /// Serves on an already-bound listener. Useful for tests that bind to
    /// an ephemeral port first.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .context("failed to read listener address")?;
        self.logger
            .info(format!("SMTP server listening on {}", addr));

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let session = Session::new(
                        stream,
                        peer,
                        self.config.clone(),
                        self.store.clone(),
                        self.logger.clone(),
                        self.tls_acceptor.clone(),
                    );
                    let logger = self.logger.clone();

                    tokio::spawn(async move {
                        if let Err(e) = session.run().await {
                            logger.debug(format!("[{}] session ended: {:#}", peer.ip(), e));
                        }
                    });
                }
                Err(e) => {
                    self.logger
                        .error(format!("Failed to accept connection: {}", e));
                }
            }
        }
    }
}

fn load_tls_acceptor(config: &Config) -> Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (&config.tls.cert, &config.tls.key) {
        (Some(cert), Some(key)) => (cert, key),
        _ => return Ok(None),
    };

    let cert_file = File::open(cert_path)
        .with_context(|| format!("failed to open certificate: {:?}", cert_path))?;
    let mut cert_reader = StdBufReader::new(cert_file);
    let cert_chain: Vec<Certificate> = certs(&mut cert_reader)
        .context("failed to parse certificate")?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        bail!("no certificate found in {:?}", cert_path);
    }

    let key_file = File::open(key_path)
        .with_context(|| format!("failed to open private key: {:?}", key_path))?;
    let mut key_reader = StdBufReader::new(key_file);
    let mut keys = pkcs8_private_keys(&mut key_reader).context("failed to parse private key")?;
    if keys.is_empty() {
        bail!("no private key found in {:?}", key_path);
    }
    let private_key = PrivateKey(keys.remove(0));

    let tls_config = RustlsConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .context("failed to build TLS config")?;

    Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogLevel;
    use crate::storage::MemoryStore;
    use std::path::PathBuf;

    fn server_with_tls(cert: Option<PathBuf>, key: Option<PathBuf>) -> (SmtpServer, crate::logger::LogReceiver) {
        let mut config = Config::default();
        config.tls.cert = cert;
        config.tls.key = key;

        let (logger, rx) = Logger::channel(16);
        let server = SmtpServer::new(Arc::new(config), Arc::new(MemoryStore::new()), logger);
        (server, rx)
    }

    #[test]
    fn missing_tls_paths_disable_starttls_silently() {
        let (server, rx) = server_with_tls(None, None);
        assert!(server.tls_acceptor.is_none());
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn unreadable_certificate_degrades_with_a_warning() {
        let (server, rx) = server_with_tls(
            Some(PathBuf::from("/nonexistent/cert.pem")),
            Some(PathBuf::from("/nonexistent/key.pem")),
        );
        assert!(server.tls_acceptor.is_none());

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.level, LogLevel::Warning);
        assert!(entry.message.contains("Failed to load TLS certificates"));
    }

    #[test]
    fn certificate_without_key_material_degrades() {
        let cert = TempPem::new("cert", "not a pem file");
        let key = TempPem::new("key", "not a pem file");

        let (server, rx) = server_with_tls(Some(cert.path.clone()), Some(key.path.clone()));
        assert!(server.tls_acceptor.is_none());
        assert_eq!(rx.try_recv().unwrap().level, LogLevel::Warning);
    }

    /// A PEM file in the temp directory, removed on drop.
    struct TempPem {
        path: PathBuf,
    }

    impl TempPem {
        fn new(label: &str, contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "smtpdrop-test-{}-{}.pem",
                std::process::id(),
                label
            ));
            std::fs::write(&path, contents).unwrap();
            TempPem { path }
        }
    }

    impl Drop for TempPem {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
