use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use structopt::StructOpt;

use smtpdrop::config::{AuthConfig, Config, ServerConfig, TlsConfig};
use smtpdrop::logger::Logger;
use smtpdrop::server::SmtpServer;
use smtpdrop::storage::{MemoryStore, MessageStore};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "smtpdrop",
    about = "A development SMTP server that captures messages for inspection"
)]
struct Opt {
    /// Listening address
    #[structopt(short = "a", long = "host", default_value = "0.0.0.0")]
    host: String,

    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "2525")]
    port: u16,

    /// Require authentication before MAIL is accepted
    #[structopt(long = "auth-required")]
    auth_required: bool,

    /// Username for SMTP AUTH (leave unset to disable AUTH)
    #[structopt(long = "auth-user", default_value = "")]
    auth_user: String,

    /// Password for SMTP AUTH
    #[structopt(long = "auth-pass", default_value = "")]
    auth_pass: String,

    /// TLS certificate file (PEM); enables STARTTLS together with --tls-key
    #[structopt(long = "tls-cert", parse(from_os_str))]
    tls_cert: Option<PathBuf>,

    /// TLS private key file (PKCS#8 PEM)
    #[structopt(long = "tls-key", parse(from_os_str))]
    tls_key: Option<PathBuf>,

    /// Log channel capacity; oldest entries are dropped on overflow
    #[structopt(long = "log-buffer", default_value = "1000")]
    log_buffer: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    let config = Arc::new(Config {
        server: ServerConfig {
            host: opt.host,
            port: opt.port,
        },
        auth: AuthConfig {
            required: opt.auth_required,
            username: opt.auth_user,
            password: opt.auth_pass,
        },
        tls: TlsConfig {
            cert: opt.tls_cert,
            key: opt.tls_key,
        },
    });

    let (logger, mut log_rx) = Logger::channel(opt.log_buffer);
    let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());

    // Print notifications as they arrive; the channel is lossy by design,
    // so a stalled stdout never stalls a session.
    tokio::spawn(async move {
        loop {
            println!("{}", log_rx.recv().await);
        }
    });

    let server = SmtpServer::new(config, store, logger);
    server.listen().await
}
