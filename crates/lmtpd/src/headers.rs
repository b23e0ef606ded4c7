//! The prepended delivery headers and the replayable view of a
//! received message (headers plus spooled body).

use crate::config::HdrDeliveryAddress;
use crate::spool::MessageSpool;
use chrono::{DateTime, Utc};
use std::io::Read;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Everything the Received/Return-Path block needs to know about the
/// transaction. Computed exactly once, when DATA is accepted.
pub struct AddedHeaderParams<'a> {
    pub lhlo: &'a str,
    pub remote_ip: IpAddr,
    pub tls_security: Option<&'a str>,
    pub my_domain: &'a str,
    pub session_id: &'a str,
    pub mail_from: &'a str,
    /// (address, decoded ORCPT) per accepted local recipient, in
    /// RCPT order. Empty when the transaction is proxied.
    pub rcpts: Vec<(&'a str, Option<&'a str>)>,
    pub hdr_delivery_address: HdrDeliveryAddress,
    pub now: DateTime<Utc>,
}

/// An ORCPT is only usable as a delivery address when it carries the
/// rfc822 address type tag.
pub fn valid_rfc822_orcpt(orcpt: Option<&str>) -> Option<&str> {
    let orcpt = orcpt?;
    if orcpt.len() >= 7 && orcpt[..7].eq_ignore_ascii_case("rfc822;") {
        Some(&orcpt[7..])
    } else {
        None
    }
}

pub fn added_headers(params: &AddedHeaderParams) -> String {
    let mut rcpt_to = None;
    if let [(address, orcpt)] = params.rcpts.as_slice() {
        match params.hdr_delivery_address {
            HdrDeliveryAddress::None => {}
            HdrDeliveryAddress::Final => rcpt_to = Some(*address),
            HdrDeliveryAddress::Original => {
                rcpt_to = Some(valid_rfc822_orcpt(*orcpt).unwrap_or(address));
            }
        }
    }

    let mut out = String::with_capacity(200);

    // Return-Path is only ours to add for local deliveries; when
    // proxying, the destination server adds its own.
    if !params.rcpts.is_empty() {
        out.push_str(&format!("Return-Path: <{}>\r\n", params.mail_from));
        if let Some(rcpt_to) = rcpt_to {
            out.push_str(&format!("Delivered-To: {rcpt_to}\r\n"));
        }
    }

    out.push_str(&format!(
        "Received: from {} ([{}])\r\n",
        params.lhlo, params.remote_ip
    ));
    if let Some(security) = params.tls_security {
        out.push_str(&format!("\t(using {security})\r\n"));
    }
    out.push_str(&format!(
        "\tby {} with LMTP id {}",
        params.my_domain, params.session_id
    ));
    out.push_str("\r\n\t");
    if let Some(rcpt_to) = rcpt_to {
        out.push_str(&format!("for <{rcpt_to}>"));
    }
    out.push_str(&format!("; {}\r\n", params.now.to_rfc2822()));
    out
}

/// The message as every delivery sees it: the added header block
/// followed by the spooled body, replayable any number of times.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub headers: String,
    pub spool: Arc<MessageSpool>,
}

impl RawMessage {
    pub fn len(&self) -> u64 {
        self.headers.len() as u64 + self.spool.len()
    }

    pub fn reader(&self) -> MessageReader {
        MessageReader {
            headers: self.headers.clone().into_bytes(),
            spool: Arc::clone(&self.spool),
            offset: 0,
        }
    }

    /// Case-insensitive lookup of a header anywhere in the combined
    /// header block (added headers plus the message's own), with
    /// continuation lines unfolded.
    pub fn header(&self, name: &str) -> Option<String> {
        let block = self.header_block();
        let mut lines = block.split(|&b| b == b'\n').peekable();
        while let Some(line) = lines.next() {
            let line = strip_cr(line);
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                continue;
            };
            if !line[..colon].eq_ignore_ascii_case(name.as_bytes()) {
                continue;
            }
            let mut value = String::from_utf8_lossy(&line[colon + 1..]).into_owned();
            while let Some(next) = lines.peek() {
                let next = strip_cr(next);
                if next.first().map(|&b| b == b' ' || b == b'\t').unwrap_or(false) {
                    value.push(' ');
                    value.push_str(String::from_utf8_lossy(next).trim());
                    lines.next();
                } else {
                    break;
                }
            }
            return Some(value.trim().to_string());
        }
        None
    }

    /// The added headers plus the message's own header block, up to
    /// the first blank line (capped so a degenerate message cannot
    /// make us buffer its entire body).
    fn header_block(&self) -> Vec<u8> {
        const MAX_HEADER_BLOCK: usize = 64 * 1024;

        let mut block = self.headers.clone().into_bytes();
        let mut reader = self.reader();
        reader.offset = self.headers.len() as u64;

        let mut chunk = [0u8; 4096];
        while block.len() < MAX_HEADER_BLOCK {
            let n = match Read::read(&mut reader, &mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            block.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_blank_line(&block) {
                block.truncate(end);
                break;
            }
        }
        block
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn find_blank_line(data: &[u8]) -> Option<usize> {
    memchr::memmem::find(data, b"\n\r\n")
        .map(|p| p + 1)
        .or_else(|| memchr::memmem::find(data, b"\n\n").map(|p| p + 1))
}

#[derive(Debug)]
pub struct MessageReader {
    headers: Vec<u8>,
    spool: Arc<MessageSpool>,
    offset: u64,
}

impl Read for MessageReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if (self.offset as usize) < self.headers.len() {
            let start = self.offset as usize;
            let n = (self.headers.len() - start).min(buf.len());
            buf[..n].copy_from_slice(&self.headers[start..start + n]);
            self.offset += n as u64;
            return Ok(n);
        }
        let spool_offset = self.offset - self.headers.len() as u64;
        let n = self.spool.read_at(spool_offset, buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

// The spool is memory or an unlinked local temp file, so positional
// reads complete without meaningful blocking.
impl AsyncRead for MessageReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let slice = buf.initialize_unfilled();
        let n = Read::read(this, slice)?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}
