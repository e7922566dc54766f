//! # smtpdrop
//!
//! A development SMTP server that captures every message sent to it instead
//! of delivering anything. Point your application at it, send mail, and
//! inspect what arrived through the [`storage::MessageStore`] collaborator.
//!
//! Supported protocol surface:
//!
//! - `HELO` / `EHLO` with capability advertisement
//! - `MAIL FROM` / `RCPT TO` / `DATA` with dot-unstuffing
//! - `STARTTLS` upgrade (when certificate material is configured)
//! - `AUTH PLAIN` and `AUTH LOGIN` (when a username is configured)
//! - `RSET`, `NOOP`, `VRFY`, `EXPN`, `QUIT`
//!
//! One tokio task per connection; log output flows through a bounded, lossy
//! channel ([`logger::Logger`]) so protocol handling never blocks on a slow
//! consumer.
//!
//! Mail relay, queuing, and spam filtering are not supported.

pub mod config;
pub mod logger;
pub mod message;
pub mod server;
pub mod session;
pub mod storage;
