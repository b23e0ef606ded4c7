//! Wire-level types and an outbound client for LMTP (RFC 2033) and
//! its SMTP (RFC 5321) variant.
//!
//! The client is used to relay a message onward to one downstream
//! server. LMTP and SMTP share everything up to the end of DATA; they
//! differ only in the handshake verb (LHLO vs EHLO) and in how many
//! replies follow the final dot: LMTP sends one reply per accepted
//! recipient, SMTP sends a single reply covering all of them.
pub mod client;
pub mod client_types;
pub mod command;

pub use client::{ClientError, LmtpClient, MAX_LINE_LEN};
pub use client_types::{EnhancedStatusCode, LmtpClientTimeouts, Response};
pub use command::{Command, EsmtpParameter, Protocol};
