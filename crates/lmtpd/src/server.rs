//! The inbound LMTP session: command dispatch, envelope state,
//! recipient resolution, DATA ingestion, and the hand-off to local
//! delivery or the outbound proxy.

use crate::address;
use crate::delivery;
use crate::directory::PassdbLookup;
use crate::dot::DotDecoder;
use crate::headers::{added_headers, AddedHeaderParams, RawMessage};
use crate::proxy::{LmtpProxy, ERRSTR_TEMP_REMOTE_FAILURE};
use crate::resolver::{self, ProxyRoute};
use crate::spool::MessageSpool;
use crate::store::{LookupContext, QuotaStatus, StoreUser};
use crate::RuntimeContext;
use chrono::Utc;
use rfc2033::client::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const MAX_LINE_LEN: usize = 4096;
const SERVICE_NAME: &str = "lmtp";

#[derive(Debug, PartialEq)]
enum Disposition {
    Continue,
    Disconnect,
}

enum ReadOutcome {
    Data,
    Eof,
    Idle,
}

/// One accepted local recipient.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub address: String,
    pub detail: String,
    pub session_id: String,
    pub orcpt: Option<String>,
    pub user: StoreUser,
}

#[derive(Default)]
struct Transaction {
    mail_from: Option<String>,
    body_7bit: bool,
    body_8bitmime: bool,
    rcpts: Vec<Recipient>,
    proxy: Option<LmtpProxy>,
}

impl Transaction {
    fn body_param(&self) -> Option<&'static str> {
        if self.body_8bitmime {
            Some("8BITMIME")
        } else if self.body_7bit {
            Some("7BIT")
        } else {
            None
        }
    }
}

pub struct LmtpServer {
    ctx: Arc<RuntimeContext>,
    socket: Option<BoxedAsyncReadAndWrite>,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    session_id: String,
    lhlo: Option<String>,
    tls_security: Option<String>,
    proxy_ttl: u32,
    peer_timeout_secs: u64,
    txn: Transaction,
}

impl LmtpServer {
    pub async fn run<S: AsyncReadAndWrite + 'static>(
        stream: S,
        ctx: Arc<RuntimeContext>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let proxy_ttl = ctx.settings.proxy_ttl;
        let mut server = Self {
            ctx,
            socket: Some(Box::new(stream)),
            read_buffer: Vec::with_capacity(1024),
            write_buffer: Vec::with_capacity(256),
            local_addr,
            remote_addr,
            session_id,
            lhlo: None,
            tls_security: None,
            proxy_ttl,
            peer_timeout_secs: 0,
            txn: Transaction::default(),
        };
        tracing::info!(
            "{}: connection from {remote_addr}",
            server.session_id
        );

        server.write_line(&format!(
            "220 {} {}",
            server.ctx.settings.my_domain(),
            server.ctx.settings.login_greeting
        ));
        server.process().await
    }

    async fn process(&mut self) -> anyhow::Result<()> {
        loop {
            let Some(line) = self.read_command_line().await? else {
                return Ok(());
            };
            tracing::trace!("{}: recv<- {line}", self.session_id);
            if self.handle_line(&line).await? == Disposition::Disconnect {
                self.uncork().await.ok();
                return Ok(());
            }
        }
    }

    // ---- line codec ----

    fn write_line(&mut self, line: &str) {
        tracing::trace!("{}: send-> {line}", self.session_id);
        self.write_buffer.extend_from_slice(line.as_bytes());
        self.write_buffer.extend_from_slice(b"\r\n");
    }

    async fn uncork(&mut self) -> anyhow::Result<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        let Some(socket) = self.socket.as_mut() else {
            anyhow::bail!("socket is gone");
        };
        socket.write_all(&self.write_buffer).await?;
        socket.flush().await?;
        self.write_buffer.clear();
        Ok(())
    }

    async fn fill_read_buffer(&mut self) -> anyhow::Result<ReadOutcome> {
        let idle = Duration::from_secs(self.ctx.settings.client_idle_timeout);
        let Some(socket) = self.socket.as_mut() else {
            return Ok(ReadOutcome::Eof);
        };
        let mut chunk = [0u8; 4096];
        match timeout(idle, socket.read(&mut chunk)).await {
            Ok(Ok(0)) => Ok(ReadOutcome::Eof),
            Ok(Ok(n)) => {
                self.read_buffer.extend_from_slice(&chunk[..n]);
                Ok(ReadOutcome::Data)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Ok(ReadOutcome::Idle),
        }
    }

    /// Next command line, with pending replies flushed first. `None`
    /// ends the session.
    async fn read_command_line(&mut self) -> anyhow::Result<Option<String>> {
        let mut too_long = false;
        loop {
            self.uncork().await?;

            if let Some(pos) = memchr::memchr(b'\n', &self.read_buffer) {
                let mut line: Vec<u8> = self.read_buffer.drain(..pos + 1).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if too_long {
                    too_long = false;
                    self.write_line("500 5.5.2 Line too long");
                    continue;
                }
                match String::from_utf8(line) {
                    Ok(line) => return Ok(Some(line)),
                    Err(_) => {
                        self.write_line("500 5.5.2 Invalid characters in command");
                        continue;
                    }
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            match self.fill_read_buffer().await? {
                ReadOutcome::Data => {}
                ReadOutcome::Eof => {
                    tracing::info!("{}: Connection lost", self.session_id);
                    return Ok(None);
                }
                ReadOutcome::Idle => {
                    self.write_line(&format!(
                        "421 4.4.2 {} Disconnected for inactivity",
                        self.ctx.settings.my_domain()
                    ));
                    self.uncork().await.ok();
                    tracing::info!("{}: Disconnected for inactivity", self.session_id);
                    return Ok(None);
                }
            }
        }
    }

    // ---- dispatch ----

    async fn handle_line(&mut self, line: &str) -> anyhow::Result<Disposition> {
        let (cmd, args) = match line.split_once(' ') {
            Some((cmd, args)) => (cmd, args),
            None => (line, ""),
        };
        if cmd.len() > 8 {
            self.write_line("502 5.5.2 Unknown command");
            return Ok(Disposition::Continue);
        }
        let cmd = cmd.to_ascii_uppercase();

        match cmd.as_str() {
            "LHLO" => self.cmd_lhlo(args),
            "MAIL" => self.cmd_mail(args).await,
            "RCPT" => self.cmd_rcpt(args).await,
            "DATA" => return self.cmd_data().await,
            "RSET" => {
                self.txn = Transaction::default();
                self.write_line("250 2.0.0 OK");
            }
            "NOOP" => self.write_line("250 2.0.0 OK"),
            "VRFY" => self.write_line("252 2.3.3 Try RCPT instead"),
            "QUIT" => {
                self.write_line("221 2.0.0 OK");
                tracing::info!(
                    "{}: Disconnect from {}: Successful quit",
                    self.session_id,
                    self.remote_addr
                );
                return Ok(Disposition::Disconnect);
            }
            "STARTTLS" => return self.cmd_starttls().await,
            "XCLIENT" => self.cmd_xclient(args),
            _ => self.write_line("502 5.5.2 Unknown command"),
        }
        Ok(Disposition::Continue)
    }

    fn is_trusted(&self) -> bool {
        self.ctx.settings.is_trusted(self.remote_addr.ip())
    }

    fn lookup_ctx(&self, session_id: &str) -> LookupContext {
        LookupContext {
            local_ip: self.local_addr.ip(),
            local_port: self.local_addr.port(),
            remote_ip: self.remote_addr.ip(),
            remote_port: self.remote_addr.port(),
            session_id: session_id.to_string(),
        }
    }

    // ---- LHLO / STARTTLS / XCLIENT ----

    fn cmd_lhlo(&mut self, args: &str) {
        if args.is_empty() {
            self.write_line("501 Missing hostname");
            return;
        }
        let domain = validate_lhlo_domain(args);

        self.txn = Transaction::default();

        self.write_line(&format!("250-{}", self.ctx.settings.my_domain()));
        if self.ctx.tls.is_some() && self.tls_security.is_none() {
            self.write_line("250-STARTTLS");
        }
        if self.is_trusted() {
            self.write_line("250-XCLIENT ADDR PORT TTL TIMEOUT");
        }
        self.write_line("250-8BITMIME");
        self.write_line("250-ENHANCEDSTATUSCODES");
        self.write_line("250 PIPELINING");

        self.lhlo = Some(domain);
    }

    async fn cmd_starttls(&mut self) -> anyhow::Result<Disposition> {
        if self.tls_security.is_some() {
            self.write_line("443 5.5.1 TLS is already active.");
            return Ok(Disposition::Continue);
        }
        let Some(acceptor) = self.ctx.tls.clone() else {
            self.write_line("454 4.7.0 Internal error, TLS not available.");
            return Ok(Disposition::Continue);
        };

        self.write_line("220 2.0.0 Begin TLS negotiation now.");
        self.uncork().await?;

        let Some(socket) = self.socket.take() else {
            anyhow::bail!("socket is gone");
        };
        match acceptor.accept(socket).await {
            Ok(stream) => {
                let (_, conn) = stream.get_ref();
                self.tls_security = Some(crate::tls::security_string(conn));
                self.socket = Some(Box::new(stream));
                self.read_buffer.clear();
                Ok(Disposition::Continue)
            }
            Err(err) => {
                tracing::error!("{}: TLS handshake failed: {err}", self.session_id);
                Ok(Disposition::Disconnect)
            }
        }
    }

    fn cmd_xclient(&mut self, args: &str) {
        if !self.is_trusted() {
            self.write_line("550 You are not from trusted IP");
            return;
        }

        let mut remote_ip = None;
        let mut remote_port = None;
        let mut ttl = None;
        let mut timeout_secs = 0;
        let mut args_ok = true;

        for arg in args.split(' ').filter(|a| !a.is_empty()) {
            let (key, value) = match arg.split_once('=') {
                Some((key, value)) => (key, value),
                None => (arg, ""),
            };
            if key.eq_ignore_ascii_case("ADDR") {
                match value.parse() {
                    Ok(ip) => remote_ip = Some(ip),
                    Err(_) => args_ok = false,
                }
            } else if key.eq_ignore_ascii_case("PORT") {
                match value.parse::<u16>() {
                    Ok(0) => {}
                    Ok(port) => remote_port = Some(port),
                    Err(_) => args_ok = false,
                }
            } else if key.eq_ignore_ascii_case("TTL") {
                match value.parse::<u32>() {
                    Ok(value) => ttl = Some(value),
                    Err(_) => args_ok = false,
                }
            } else if key.eq_ignore_ascii_case("TIMEOUT") {
                match value.parse::<u64>() {
                    Ok(value) => timeout_secs = value,
                    Err(_) => args_ok = false,
                }
            }
        }
        if !args_ok {
            self.write_line("501 Invalid parameters");
            return;
        }

        self.txn = Transaction::default();
        if let Some(ip) = remote_ip {
            self.remote_addr.set_ip(ip);
        }
        if let Some(port) = remote_port {
            self.remote_addr.set_port(port);
        }
        if let Some(ttl) = ttl {
            self.proxy_ttl = ttl;
        }
        self.peer_timeout_secs = timeout_secs;
        self.write_line(&format!(
            "220 {} {}",
            self.ctx.settings.my_domain(),
            self.ctx.settings.login_greeting
        ));
    }

    // ---- MAIL ----

    async fn cmd_mail(&mut self, args: &str) {
        if self.txn.mail_from.is_some() {
            self.write_line("503 5.5.1 MAIL already given");
            return;
        }
        if args.len() < 5 || !args[..5].eq_ignore_ascii_case("FROM:") {
            self.write_line("501 5.5.4 Invalid parameters");
            return;
        }
        let Some((addr, params)) = address::parse_path(&args[5..]) else {
            self.write_line("501 5.5.4 Invalid parameters");
            return;
        };

        let mut body_7bit = false;
        let mut body_8bitmime = false;
        for param in params.split(' ').filter(|p| !p.is_empty()) {
            if param.eq_ignore_ascii_case("BODY=7BIT") {
                body_7bit = true;
            } else if param.eq_ignore_ascii_case("BODY=8BITMIME") {
                body_8bitmime = true;
            } else {
                self.write_line("501 5.5.4 Unsupported options");
                return;
            }
        }

        self.txn.mail_from = Some(addr.to_string());
        self.txn.body_7bit = body_7bit;
        self.txn.body_8bitmime = body_8bitmime;
        self.write_line("250 2.1.0 OK");

        if self.ctx.settings.lmtp_user_concurrency_limit > 0 {
            // open the broker connection before delivery might drop
            // privileges
            self.ctx.anvil().await;
        }
    }

    // ---- RCPT ----

    async fn cmd_rcpt(&mut self, args: &str) {
        if self.txn.mail_from.is_none() {
            self.write_line("503 5.5.1 MAIL needed first");
            return;
        }
        if args.len() < 3 || !args[..3].eq_ignore_ascii_case("TO:") {
            self.write_line("501 5.5.4 Invalid parameters");
            return;
        }
        let Some((addr, params)) = address::parse_path(&args[3..]) else {
            self.write_line("501 5.5.4 Invalid parameters");
            return;
        };
        let address = address::unquote_local_part(addr);

        let mut orcpt = None;
        for param in params.split(' ').filter(|p| !p.is_empty()) {
            if param.len() >= 6 && param[..6].eq_ignore_ascii_case("ORCPT=") {
                orcpt = Some(address::xtext_decode(&param[6..]));
            } else {
                self.write_line("501 5.5.4 Unsupported options");
                return;
            }
        }

        let (stripped, delim, detail) =
            address::split_detail(&address, &self.ctx.settings.recipient_delimiter);
        // lookups key on the bare username; routing decides what the
        // rest of the address means
        let username = match stripped.split_once('@') {
            Some((local, _)) => local.to_string(),
            None => stripped,
        };

        if self.ctx.settings.lmtp_proxy
            && self
                .try_proxy_rcpt(&address, &username, delim, &detail)
                .await
        {
            return;
        }

        // Each delivery gets its own session id for log correlation.
        let rcpt_session_id = if self.txn.rcpts.is_empty() {
            self.session_id.clone()
        } else {
            format!("{}:{}", self.session_id, self.txn.rcpts.len() + 1)
        };
        let ctx = self.lookup_ctx(&rcpt_session_id);

        let user = match self.ctx.store.lookup_user(&username, &ctx).await {
            Err(err) => {
                tracing::error!(
                    "{}: Failed to lookup user {username}: {err:#}",
                    self.session_id
                );
                self.write_line(&format!("451 4.3.0 <{address}> Temporary internal error"));
                return;
            }
            Ok(None) => {
                self.write_line(&format!(
                    "550 5.1.1 <{address}> User doesn't exist: {username}"
                ));
                return;
            }
            Ok(Some(user)) => user,
        };

        if self.txn.proxy.is_some() {
            self.write_line(&format!(
                "451 4.3.0 <{address}> Can't handle mixed proxy/non-proxy destinations"
            ));
            return;
        }

        let address = address::translate(&address, &self.ctx.settings.lmtp_address_translate);
        let rcpt = Recipient {
            address,
            detail,
            session_id: rcpt_session_id,
            orcpt,
            user,
        };

        if self.ctx.settings.lmtp_rcpt_check_quota {
            match self.ctx.store.quota_status(&rcpt.user).await {
                Ok(QuotaStatus::Ok) => {}
                Ok(QuotaStatus::Exceeded(error)) => {
                    let code = if self.ctx.settings.quota_full_tempfail {
                        "452 4.2.2"
                    } else {
                        "552 5.2.2"
                    };
                    self.write_line(&format!("{code} <{}> {error}", rcpt.address));
                    return;
                }
                Err(err) => {
                    tracing::error!(
                        "{}: Failed to check quota for {}: {err:#}",
                        self.session_id,
                        rcpt.user.username
                    );
                    self.write_line(&format!(
                        "451 4.3.0 <{}> Temporary internal error",
                        rcpt.address
                    ));
                    return;
                }
            }
        }

        // Concurrency gate: no further commands are consumed while
        // the broker round-trip is outstanding, which is exactly the
        // pipelining pause the protocol requires.
        let limit = self.ctx.settings.lmtp_user_concurrency_limit;
        if limit > 0 {
            let count = match self.ctx.anvil().await {
                Some(anvil) => match anvil.lookup(SERVICE_NAME, &rcpt.user.username).await {
                    Ok(count) => count,
                    Err(err) => {
                        tracing::error!("{}: anvil lookup failed: {err:#}", self.session_id);
                        0
                    }
                },
                None => 0,
            };
            if count >= limit {
                self.write_line(&format!(
                    "451 4.3.0 <{}> Too many concurrent deliveries for user",
                    rcpt.address
                ));
                return;
            }
        }

        let username = rcpt.user.username.clone();
        self.txn.rcpts.push(rcpt);
        self.write_line("250 2.1.5 OK");

        if limit > 0 {
            if let Some(anvil) = self.ctx.anvil().await {
                if let Err(err) = anvil.register_connect(SERVICE_NAME, &username).await {
                    tracing::debug!("{}: anvil CONNECT failed: {err:#}", self.session_id);
                }
            }
        }
    }

    /// The proxy side of RCPT resolution. Returns true when the RCPT
    /// was consumed (either routed or answered with an error); false
    /// falls through to the local path.
    async fn try_proxy_rcpt(
        &mut self,
        address: &str,
        username: &str,
        delim: Option<char>,
        detail: &str,
    ) -> bool {
        let ctx = self.lookup_ctx(&self.session_id.clone());
        let fields = match self.ctx.directory.passdb_lookup(username, &ctx).await {
            Err(err) => {
                tracing::error!("{}: passdb lookup {username}: {err:#}", self.session_id);
                self.write_line(&format!(
                    "451 4.3.0 <{address}> Temporary user lookup failure"
                ));
                return true;
            }
            Ok(PassdbLookup::NotFound) => return false,
            Ok(PassdbLookup::Found(fields)) => fields,
        };

        let ProxyRoute {
            destination,
            destuser,
        } = match resolver::parse_proxy_fields(&fields, self.local_addr.port()) {
            Ok(Some(route)) => route,
            Ok(None) => return false,
            Err(reason) => {
                tracing::error!("{}: {reason}", self.session_id);
                self.write_line(&format!(
                    "451 4.3.0 <{address}> Temporary user lookup failure"
                ));
                return true;
            }
        };

        let mut proxied_address = address.to_string();
        match destuser {
            Some(new_username) if new_username != username => {
                // the username changed; rebuild the address around it
                proxied_address = match delim {
                    Some(delim) if !detail.is_empty() => {
                        address::add_detail(&new_username, delim, detail)
                    }
                    _ => new_username,
                };
            }
            _ => {
                if resolver::is_ourself(&destination, self.local_addr.ip(), self.local_addr.port())
                {
                    tracing::error!(
                        "{}: Proxying to <{username}> loops to itself",
                        self.session_id
                    );
                    self.write_line(&format!("554 5.4.6 <{address}> Proxying loops to itself"));
                    return true;
                }
            }
        }

        if self.proxy_ttl <= 1 {
            tracing::error!(
                "{}: Proxying to <{username}> appears to be looping (TTL=0)",
                self.session_id
            );
            self.write_line(&format!(
                "554 5.4.6 <{username}> Proxying appears to be looping (TTL=0)"
            ));
            return true;
        }
        if !self.txn.rcpts.is_empty() {
            self.write_line(&format!(
                "451 4.3.0 <{address}> Can't handle mixed proxy/non-proxy destinations"
            ));
            return true;
        }

        if self.txn.proxy.is_none() {
            let mail_from = self.txn.mail_from.clone().expect("MAIL checked earlier");
            self.txn.proxy = Some(LmtpProxy::new(
                self.ctx.settings.my_hostname.clone(),
                self.session_id.clone(),
                self.remote_addr.ip(),
                self.remote_addr.port(),
                self.proxy_ttl - 1,
                mail_from,
                self.txn.body_param(),
            ));
        }
        self.txn
            .proxy
            .as_mut()
            .expect("proxy created above")
            .add_rcpt(destination, proxied_address);
        self.write_line("250 2.1.5 OK");
        true
    }

    // ---- DATA ----

    async fn cmd_data(&mut self) -> anyhow::Result<Disposition> {
        if self.txn.mail_from.is_none() {
            self.write_line("503 5.5.1 MAIL needed first");
            return Ok(Disposition::Continue);
        }
        if self.txn.rcpts.is_empty() && self.txn.proxy.is_none() {
            self.write_line("554 5.5.1 No valid recipients");
            return Ok(Disposition::Continue);
        }

        let headers = added_headers(&AddedHeaderParams {
            lhlo: self.lhlo.as_deref().unwrap_or("unknown"),
            remote_ip: self.remote_addr.ip(),
            tls_security: self.tls_security.as_deref(),
            my_domain: self.ctx.settings.my_domain(),
            session_id: &self.session_id,
            mail_from: self.txn.mail_from.as_deref().expect("checked above"),
            rcpts: self
                .txn
                .rcpts
                .iter()
                .map(|r| (r.address.as_str(), r.orcpt.as_deref()))
                .collect(),
            hdr_delivery_address: self.ctx.settings.lmtp_hdr_delivery_address,
            now: Utc::now(),
        });

        // the go-ahead must be on the wire before we wait for body
        // bytes
        self.write_line("354 OK");
        self.uncork().await?;

        let mut spool = MessageSpool::new(&self.ctx.settings.spool_dir);
        let mut decoder = DotDecoder::new();
        let mut decoded = Vec::with_capacity(8192);
        loop {
            if !self.read_buffer.is_empty() {
                let (used, done) = decoder.feed(&self.read_buffer, &mut decoded);
                self.read_buffer.drain(..used);
                if !decoded.is_empty() {
                    if let Err(err) = spool.append(&decoded) {
                        tracing::error!("{}: spool write failed: {err:#}", self.session_id);
                        self.write_line("451 4.3.0 Temporary internal failure");
                        self.uncork().await.ok();
                        return Ok(Disposition::Disconnect);
                    }
                    decoded.clear();
                }
                if done {
                    break;
                }
            }
            match self.fill_read_buffer().await? {
                ReadOutcome::Data => {}
                ReadOutcome::Eof | ReadOutcome::Idle => {
                    // no terminator, no success reply
                    tracing::info!("{}: Disconnected in DATA", self.session_id);
                    return Ok(Disposition::Disconnect);
                }
            }
        }

        tracing::debug!(
            "{}: received {} body bytes{}",
            self.session_id,
            spool.len(),
            if spool.is_spilled() { " (spooled)" } else { "" }
        );

        let message = RawMessage {
            headers,
            spool: Arc::new(spool),
        };

        if !self.txn.rcpts.is_empty() {
            let replies = delivery::deliver_local(
                self.ctx.store.as_ref(),
                &self.ctx.settings,
                &self.txn.rcpts,
                self.txn.mail_from.as_deref().expect("checked above"),
                self.peer_timeout_secs,
                &message,
            )
            .await;
            for reply in replies {
                self.write_line(&reply);
            }
        } else if let Some(proxy) = self.txn.proxy.take() {
            let replies = proxy.run(&message).await;
            // every proxied recipient gets exactly one final reply,
            // in RCPT order
            debug_assert_eq!(replies.len(), proxy.rcpt_count());
            for reply in replies {
                self.write_line(&reply);
            }
        } else {
            // can't happen: DATA requires recipients
            self.write_line(ERRSTR_TEMP_REMOTE_FAILURE);
        }

        self.txn = Transaction::default();
        Ok(Disposition::Continue)
    }
}

/// LHLO takes a domain or a bracketed address literal; anything
/// malformed is recorded as the literal string `invalid` rather than
/// rejected.
fn validate_lhlo_domain(args: &str) -> String {
    fn is_atext(c: char) -> bool {
        c.is_ascii_alphanumeric()
            || matches!(
                c,
                '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '/' | '='
                    | '?' | '^' | '_' | '`' | '{' | '|' | '}' | '~'
            )
    }

    let valid = if let Some(inner) = args.strip_prefix('[') {
        match inner.strip_suffix(']') {
            Some(literal) => {
                !literal.is_empty() && !literal.contains(&['\\', '[', ']'][..])
            }
            None => false,
        }
    } else {
        !args.is_empty() && args.split('.').all(|atom| !atom.is_empty() && atom.chars().all(is_atext))
    };

    if valid {
        args.to_string()
    } else {
        "invalid".to_string()
    }
}
