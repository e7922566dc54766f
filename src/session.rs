//! Per-connection SMTP session: command parsing, transaction-state
//! enforcement, the DATA sub-protocol, STARTTLS, and AUTH PLAIN/LOGIN.

use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::logger::Logger;
use crate::message;
use crate::storage::{Message, MessageStore};

/// Unified stream for plain and TLS connections, so STARTTLS can swap the
/// transport underneath a running session.
enum SmtpStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
    /// Transient placeholder while the STARTTLS handshake owns the socket;
    /// never observable by I/O.
    Upgrading,
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Upgrading => panic!("I/O on SmtpStream during STARTTLS upgrade"),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Upgrading => panic!("I/O on SmtpStream during STARTTLS upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Upgrading => panic!("I/O on SmtpStream during STARTTLS upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Upgrading => panic!("I/O on SmtpStream during STARTTLS upgrade"),
        }
    }
}

/// Command verbs, matched after upper-casing. Anything else is `Unknown`
/// and answered with 502.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Expn,
    StartTls,
    Auth,
    Unknown,
}

impl Command {
    fn from_verb(verb: &str) -> Command {
        match verb {
            "HELO" => Command::Helo,
            "EHLO" => Command::Ehlo,
            "MAIL" => Command::Mail,
            "RCPT" => Command::Rcpt,
            "DATA" => Command::Data,
            "RSET" => Command::Rset,
            "NOOP" => Command::Noop,
            "QUIT" => Command::Quit,
            "VRFY" => Command::Vrfy,
            "EXPN" => Command::Expn,
            "STARTTLS" => Command::StartTls,
            "AUTH" => Command::Auth,
            _ => Command::Unknown,
        }
    }
}

enum Flow {
    Continue,
    /// The session is done: QUIT, EOF mid-exchange, or a failed STARTTLS
    /// handshake. No further I/O happens on the stream.
    Quit,
}

enum ChallengeResponse {
    Decoded(String),
    BadEncoding,
    Eof,
}

pub struct Session {
    config: Arc<Config>,
    store: Arc<dyn MessageStore>,
    logger: Logger,
    tls_acceptor: Option<TlsAcceptor>,
    stream: BufReader<SmtpStream>,
    client_ip: String,
    helo: String,
    mail_from: String,
    rcpt_to: Vec<String>,
    authenticated: bool,
    tls_active: bool,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        config: Arc<Config>,
        store: Arc<dyn MessageStore>,
        logger: Logger,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            config,
            store,
            logger,
            tls_acceptor,
            stream: BufReader::new(SmtpStream::Plain(stream)),
            client_ip: peer.ip().to_string(),
            helo: String::new(),
            mail_from: String::new(),
            rcpt_to: Vec::new(),
            authenticated: false,
            tls_active: false,
        }
    }

    /// Runs the session to completion. I/O errors propagate and terminate
    /// the session without any further reply; the error concerns only this
    /// connection.
    pub async fn run(mut self) -> Result<()> {
        self.logger
            .info(format!("New connection from {}", self.client_ip));
        self.write_line("220 smtpdrop ESMTP Service Ready").await?;

        loop {
            let line = match self.read_line().await? {
                Some(line) => line,
                None => {
                    self.logger
                        .info(format!("Connection closed from {}", self.client_ip));
                    return Ok(());
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (verb, args) = split_command(line);
            self.logger
                .debug(format!("[{}] C: {} {}", self.client_ip, verb, args));

            match self.handle_command(Command::from_verb(&verb), &args).await? {
                Flow::Continue => {}
                Flow::Quit => return Ok(()),
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command, args: &str) -> Result<Flow> {
        match cmd {
            Command::Helo => self.handle_helo(args).await?,
            Command::Ehlo => self.handle_ehlo(args).await?,
            Command::Mail => self.handle_mail(args).await?,
            Command::Rcpt => self.handle_rcpt(args).await?,
            Command::Data => return self.handle_data().await,
            Command::Rset => {
                self.mail_from.clear();
                self.rcpt_to.clear();
                self.logger
                    .debug(format!("[{}] Session reset", self.client_ip));
                self.write_line("250 OK").await?;
            }
            Command::Noop => self.write_line("250 OK").await?,
            Command::Quit => {
                self.write_line("221 Bye").await?;
                self.logger
                    .info(format!("Connection closed by client {}", self.client_ip));
                return Ok(Flow::Quit);
            }
            Command::Vrfy => {
                self.write_line("252 Cannot VRFY user, but will accept message")
                    .await?;
            }
            Command::Expn => self.write_line("252 Cannot expand mailing list").await?,
            Command::StartTls => return self.handle_starttls().await,
            Command::Auth => return self.handle_auth(args).await,
            Command::Unknown => {
                self.logger
                    .warn(format!("[{}] Unknown command", self.client_ip));
                self.write_line("502 Command not implemented").await?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_helo(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            return self.write_line("501 Syntax: HELO hostname").await;
        }

        self.helo = args.to_string();
        self.logger
            .info(format!("[{}] HELO {}", self.client_ip, args));
        self.write_line(&format!("250 Hello {}", args)).await
    }

    async fn handle_ehlo(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            return self.write_line("501 Syntax: EHLO hostname").await;
        }

        self.helo = args.to_string();
        self.logger
            .info(format!("[{}] EHLO {}", self.client_ip, args));

        self.write_line(&format!("250-Hello {}", args)).await?;
        self.write_line("250-SIZE 10485760").await?;
        self.write_line("250-8BITMIME").await?;
        self.write_line("250-PIPELINING").await?;

        if self.tls_acceptor.is_some() && !self.tls_active {
            self.write_line("250-STARTTLS").await?;
        }

        if self.config.auth_enabled() {
            self.write_line("250-AUTH PLAIN LOGIN").await?;
        }

        self.write_line("250 HELP").await
    }

    async fn handle_mail(&mut self, args: &str) -> Result<()> {
        if self.config.auth.required && !self.authenticated {
            self.logger.warn(format!(
                "[{}] AUTH required but not authenticated",
                self.client_ip
            ));
            return self.write_line("530 Authentication required").await;
        }

        let rest = match strip_prefix_ignore_case(args, "FROM:") {
            Some(rest) => rest,
            None => return self.write_line("501 Syntax: MAIL FROM:<address>").await,
        };

        let addr = strip_angle_brackets(rest);
        self.logger
            .info(format!("[{}] MAIL FROM:<{}>", self.client_ip, addr));

        // MAIL opens a fresh transaction.
        self.rcpt_to.clear();
        self.mail_from = addr;
        self.write_line("250 OK").await
    }

    async fn handle_rcpt(&mut self, args: &str) -> Result<()> {
        if self.mail_from.is_empty() {
            return self.write_line("503 Need MAIL command first").await;
        }

        let rest = match strip_prefix_ignore_case(args, "TO:") {
            Some(rest) => rest,
            None => return self.write_line("501 Syntax: RCPT TO:<address>").await,
        };

        let addr = strip_angle_brackets(rest);
        self.logger
            .info(format!("[{}] RCPT TO:<{}>", self.client_ip, addr));

        self.rcpt_to.push(addr);
        self.write_line("250 OK").await
    }

    async fn handle_data(&mut self) -> Result<Flow> {
        if self.rcpt_to.is_empty() {
            self.write_line("503 Need RCPT command first").await?;
            return Ok(Flow::Continue);
        }

        self.logger
            .info(format!("[{}] DATA started", self.client_ip));
        self.write_line("354 Start mail input; end with <CRLF>.<CRLF>")
            .await?;

        let mut lines = Vec::new();
        loop {
            let line = match self.read_line().await? {
                Some(line) => line,
                // Peer vanished before the terminator: no reply.
                None => return Ok(Flow::Quit),
            };

            if line == "." {
                break;
            }

            lines.push(message::unstuff_line(&line).to_string());
        }

        let raw = lines.join("\r\n");
        let parsed = message::parse_mail(&raw);

        let mut msg = Message::new(
            self.mail_from.clone(),
            self.rcpt_to.join(", "),
            parsed.subject,
            parsed.body,
            raw.into_bytes(),
            self.client_ip.clone(),
        );

        if let Err(e) = self.store.save(&mut msg) {
            self.logger.error(format!(
                "[{}] Failed to save message: {:#}",
                self.client_ip, e
            ));
            // Transaction intentionally left in place so the client may retry.
            self.write_line("451 Requested action aborted: local error in processing")
                .await?;
            return Ok(Flow::Continue);
        }

        self.logger.info(format!(
            "[{}] Message received: {} -> {} ({} bytes) Subject: {}",
            self.client_ip, msg.sender, msg.recipients, msg.size, msg.subject
        ));
        self.write_line("250 OK: Message queued").await?;

        self.mail_from.clear();
        self.rcpt_to.clear();
        Ok(Flow::Continue)
    }

    async fn handle_starttls(&mut self) -> Result<Flow> {
        let acceptor = match self.tls_acceptor.clone() {
            Some(acceptor) => acceptor,
            None => {
                self.write_line("454 TLS not available").await?;
                return Ok(Flow::Continue);
            }
        };

        if self.tls_active {
            self.write_line("503 TLS already active").await?;
            return Ok(Flow::Continue);
        }

        self.logger
            .info(format!("[{}] STARTTLS initiated", self.client_ip));
        self.write_line("220 Ready to start TLS").await?;

        // Take the socket back; any buffered plaintext is discarded.
        let plain = mem::replace(&mut self.stream, BufReader::new(SmtpStream::Upgrading));
        let socket = match plain.into_inner() {
            SmtpStream::Plain(socket) => socket,
            _ => unreachable!("STARTTLS accepted on a non-plain stream"),
        };

        match acceptor.accept(socket).await {
            Ok(tls_stream) => {
                self.stream = BufReader::new(SmtpStream::Tls(tls_stream));
                self.tls_active = true;
                self.logger
                    .info(format!("[{}] TLS handshake successful", self.client_ip));

                // Everything negotiated in the clear is forgotten.
                self.helo.clear();
                self.mail_from.clear();
                self.rcpt_to.clear();
                self.authenticated = false;
                Ok(Flow::Continue)
            }
            Err(e) => {
                self.logger.error(format!(
                    "[{}] TLS handshake failed: {}",
                    self.client_ip, e
                ));
                Ok(Flow::Quit)
            }
        }
    }

    async fn handle_auth(&mut self, args: &str) -> Result<Flow> {
        if !self.config.auth_enabled() {
            self.write_line("503 Authentication not configured").await?;
            return Ok(Flow::Continue);
        }

        let (mechanism, initial) = match args.split_once(' ') {
            Some((mech, rest)) => (mech.to_uppercase(), Some(rest)),
            None => (args.to_uppercase(), None),
        };

        self.logger.info(format!(
            "[{}] AUTH {} attempted",
            self.client_ip, mechanism
        ));

        match mechanism.as_str() {
            "PLAIN" => self.auth_plain(initial).await,
            "LOGIN" => self.auth_login().await,
            _ => {
                self.write_line("504 Unrecognized authentication mechanism")
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn auth_plain(&mut self, initial: Option<&str>) -> Result<Flow> {
        let payload = match initial {
            Some(payload) => payload.to_string(),
            None => {
                self.write_line("334 ").await?;
                match self.read_line().await? {
                    Some(line) => line.trim().to_string(),
                    None => return Ok(Flow::Quit),
                }
            }
        };

        // A payload that does not decode to exactly {authzid, user, pass}
        // is an authentication failure, not a syntax error.
        let decoded = match BASE64.decode(payload.as_bytes()) {
            Ok(decoded) => decoded,
            Err(_) => {
                self.write_line("535 Authentication failed").await?;
                return Ok(Flow::Continue);
            }
        };

        let decoded = String::from_utf8_lossy(&decoded);
        let fields: Vec<&str> = decoded.split('\0').collect();
        if fields.len() != 3 {
            self.write_line("535 Authentication failed").await?;
            return Ok(Flow::Continue);
        }

        self.check_credentials(fields[1], fields[2]).await?;
        Ok(Flow::Continue)
    }

    async fn auth_login(&mut self) -> Result<Flow> {
        self.write_line("334 VXNlcm5hbWU6").await?; // "Username:"
        let username = match self.read_challenge_response().await? {
            ChallengeResponse::Decoded(username) => username,
            ChallengeResponse::BadEncoding => {
                self.write_line("501 Invalid base64").await?;
                return Ok(Flow::Continue);
            }
            ChallengeResponse::Eof => return Ok(Flow::Quit),
        };

        self.write_line("334 UGFzc3dvcmQ6").await?; // "Password:"
        let password = match self.read_challenge_response().await? {
            ChallengeResponse::Decoded(password) => password,
            ChallengeResponse::BadEncoding => {
                self.write_line("501 Invalid base64").await?;
                return Ok(Flow::Continue);
            }
            ChallengeResponse::Eof => return Ok(Flow::Quit),
        };

        self.check_credentials(&username, &password).await?;
        Ok(Flow::Continue)
    }

    async fn read_challenge_response(&mut self) -> Result<ChallengeResponse> {
        let line = match self.read_line().await? {
            Some(line) => line,
            None => return Ok(ChallengeResponse::Eof),
        };

        match BASE64.decode(line.trim().as_bytes()) {
            Ok(decoded) => Ok(ChallengeResponse::Decoded(
                String::from_utf8_lossy(&decoded).into_owned(),
            )),
            Err(_) => Ok(ChallengeResponse::BadEncoding),
        }
    }

    async fn check_credentials(&mut self, username: &str, password: &str) -> Result<()> {
        if username == self.config.auth.username && password == self.config.auth.password {
            self.authenticated = true;
            self.logger.info(format!(
                "[{}] AUTH successful for user: {}",
                self.client_ip, username
            ));
            self.write_line("235 Authentication successful").await
        } else {
            self.logger.warn(format!(
                "[{}] AUTH failed for user: {}",
                self.client_ip, username
            ));
            self.write_line("535 Authentication failed").await
        }
    }

    /// Reads one line with the trailing line ending stripped (a bare LF is
    /// accepted); leading whitespace is preserved for the DATA phase.
    /// `None` means EOF.
    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Splits a command line on the first space into an upper-cased verb and a
/// trimmed argument string. A missing argument is the empty string.
fn split_command(line: &str) -> (String, String) {
    match line.split_once(' ') {
        Some((verb, rest)) => (verb.to_uppercase(), rest.trim().to_string()),
        None => (line.to_uppercase(), String::new()),
    }
}

fn strip_angle_brackets(addr: &str) -> String {
    addr.trim()
        .trim_matches(|c| c == '<' || c == '>')
        .to_string()
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_map_to_commands() {
        assert_eq!(Command::from_verb("HELO"), Command::Helo);
        assert_eq!(Command::from_verb("STARTTLS"), Command::StartTls);
        assert_eq!(Command::from_verb("BOGUS"), Command::Unknown);
    }

    #[test]
    fn split_command_uppercases_verb_and_trims_args() {
        assert_eq!(
            split_command("mail FROM:<a@x>  "),
            ("MAIL".to_string(), "FROM:<a@x>".to_string())
        );
        assert_eq!(split_command("noop"), ("NOOP".to_string(), String::new()));
        assert_eq!(split_command("HELO "), ("HELO".to_string(), String::new()));
    }

    #[test]
    fn prefix_match_ignores_case_and_keeps_address_case() {
        assert_eq!(
            strip_prefix_ignore_case("from:<User@X>", "FROM:"),
            Some("<User@X>")
        );
        assert_eq!(strip_prefix_ignore_case("<a@x>", "FROM:"), None);
        assert_eq!(strip_prefix_ignore_case("FR", "FROM:"), None);
    }
}
