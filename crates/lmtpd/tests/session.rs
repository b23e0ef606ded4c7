//! Full-session tests: an in-process server driven over a duplex
//! stream, with fake store, directory, broker, and upstream servers.

use async_trait::async_trait;
use lmtpd::config::LmtpSettings;
use lmtpd::directory::{PassdbLookup, StaticDirectory, UserDirectory};
use lmtpd::server::LmtpServer;
use lmtpd::store::{
    DeliveryOutcome, DeliveryRequest, LookupContext, MailStore, QuotaStatus, SavedMail, StoreUser,
};
use lmtpd::RuntimeContext;
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufStream};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Delivery {
    username: String,
    mailbox: String,
    session_id: String,
    dest_addr: String,
    body: Vec<u8>,
    had_src_mail: bool,
}

#[derive(Default)]
struct RecordingStore {
    users: HashMap<String, StoreUser>,
    quota_exceeded: Vec<String>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingStore {
    fn with_users(names: &[&str]) -> Self {
        let users = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    StoreUser {
                        username: name.to_string(),
                        uid: None,
                        namespace_prefix: String::new(),
                        quota_bytes: None,
                    },
                )
            })
            .collect();
        Self {
            users,
            ..Self::default()
        }
    }

    fn deliveries(&self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries.lock().unwrap())
    }
}

#[async_trait]
impl MailStore for RecordingStore {
    async fn lookup_user(
        &self,
        username: &str,
        _ctx: &LookupContext,
    ) -> anyhow::Result<Option<StoreUser>> {
        Ok(self.users.get(username).cloned())
    }

    async fn quota_status(&self, user: &StoreUser) -> anyhow::Result<QuotaStatus> {
        if self.quota_exceeded.contains(&user.username) {
            Ok(QuotaStatus::Exceeded(
                "Quota exceeded (mailbox for user is full)".to_string(),
            ))
        } else {
            Ok(QuotaStatus::Ok)
        }
    }

    async fn deliver(&self, request: DeliveryRequest<'_>) -> DeliveryOutcome {
        let mut body = vec![];
        Read::read_to_end(&mut request.message.reader(), &mut body).unwrap();
        self.deliveries.lock().unwrap().push(Delivery {
            username: request.user.username.clone(),
            mailbox: request.mailbox.clone(),
            session_id: request.session_id.to_string(),
            dest_addr: request.dest_addr.to_string(),
            body,
            had_src_mail: request.src_mail.is_some(),
        });
        DeliveryOutcome::Saved {
            saved: request.want_saved_handle.then(|| SavedMail(Box::new(()))),
        }
    }
}

struct FailingDirectory;

#[async_trait]
impl UserDirectory for FailingDirectory {
    async fn passdb_lookup(
        &self,
        _username: &str,
        _ctx: &LookupContext,
    ) -> anyhow::Result<PassdbLookup> {
        anyhow::bail!("directory is on fire")
    }
}

struct Session {
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    reader: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Session {
    fn start(settings: LmtpSettings, store: Arc<RecordingStore>) -> Self {
        let directory = Arc::new(StaticDirectory::new(settings.users.clone()));
        Self::start_with_directory(settings, store, directory)
    }

    fn start_with_directory(
        settings: LmtpSettings,
        store: Arc<RecordingStore>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        let ctx = Arc::new(RuntimeContext::new(settings, store, directory, None));
        let (client, server) = tokio::io::duplex(65536);
        let task = tokio::spawn(LmtpServer::run(
            server,
            ctx,
            "192.0.2.1:24".parse().unwrap(),
            "192.0.2.9:55555".parse().unwrap(),
        ));
        let (read_half, write_half) = tokio::io::split(client);
        Self {
            writer: write_half,
            reader: BufReader::new(read_half),
            task,
        }
    }

    async fn send(&mut self, data: &str) {
        self.writer.write_all(data.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            self.reader.read_line(&mut line),
        )
        .await
        .expect("timed out waiting for a reply")
        .unwrap();
        line.trim_end().to_string()
    }

    /// Read through the multiline LHLO capability block, returning
    /// every line.
    async fn read_capabilities(&mut self) -> Vec<String> {
        let mut lines = vec![];
        loop {
            let line = self.read_line().await;
            let done = line.as_bytes().get(3) == Some(&b' ');
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }

    async fn handshake(&mut self, mail_from: &str) {
        assert!(self.read_line().await.starts_with("220 "));
        self.send("LHLO client.example.org\r\n").await;
        self.read_capabilities().await;
        self.send(&format!("MAIL FROM:<{mail_from}>\r\n")).await;
        assert_eq!(self.read_line().await, "250 2.1.0 OK");
    }

    async fn quit(mut self) {
        self.send("QUIT\r\n").await;
        assert_eq!(self.read_line().await, "221 2.0.0 OK");
        self.task.await.unwrap().unwrap();
    }
}

fn settings() -> LmtpSettings {
    let mut settings = LmtpSettings::default();
    settings.my_hostname = "mx.example.com".to_string();
    settings.my_domain = "example.com".to_string();
    settings.spool_dir = std::env::temp_dir();
    settings
}

fn proxied_user(host: &str, port: u16, extra: &[(&str, &str)]) -> HashMap<String, String> {
    let mut fields = HashMap::from([
        ("proxy".to_string(), String::new()),
        ("host".to_string(), host.to_string()),
        ("port".to_string(), port.to_string()),
    ]);
    for (key, value) in extra {
        fields.insert(key.to_string(), value.to_string());
    }
    fields
}

// S1: minimal local delivery.
#[tokio::test]
async fn minimal_local_delivery() {
    let store = Arc::new(RecordingStore::with_users(&["u"]));
    let mut session = Session::start(settings(), Arc::clone(&store));

    assert!(session.read_line().await.starts_with("220 example.com"));
    session.send("LHLO host\r\n").await;
    let caps = session.read_capabilities().await;
    assert_eq!(caps[0], "250-example.com");
    assert!(caps.contains(&"250-8BITMIME".to_string()));
    assert!(caps.contains(&"250-ENHANCEDSTATUSCODES".to_string()));
    assert_eq!(caps.last().unwrap(), "250 PIPELINING");
    // untrusted peer, no TLS configured
    assert!(!caps.iter().any(|c| c.contains("XCLIENT")));
    assert!(!caps.iter().any(|c| c.contains("STARTTLS")));

    session.send("MAIL FROM:<a@x>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.0 OK");
    session.send("RCPT TO:<u@y>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    session.send("DATA\r\n").await;
    assert_eq!(session.read_line().await, "354 OK");
    session.send("Subject: t\r\n\r\nhi\r\n.\r\n").await;
    let reply = session.read_line().await;
    assert!(
        reply.starts_with("250 2.0.0 <u@y> ") && reply.ends_with(" Saved"),
        "{reply}"
    );
    session.quit().await;

    let deliveries = store.deliveries();
    assert_eq!(deliveries.len(), 1);
    let delivery = &deliveries[0];
    assert_eq!(delivery.username, "u");
    assert_eq!(delivery.mailbox, "INBOX");
    assert_eq!(delivery.dest_addr, "u@y");
    let body = String::from_utf8(delivery.body.clone()).unwrap();
    assert!(body.starts_with("Return-Path: <a@x>\r\nReceived: from host ([192.0.2.9])\r\n"));
    assert!(body.contains("\tby example.com with LMTP id "));
    assert!(body.ends_with("Subject: t\r\n\r\nhi\r\n"));
}

// S2: unknown user.
#[tokio::test]
async fn unknown_user() {
    let store = Arc::new(RecordingStore::with_users(&["u"]));
    let mut session = Session::start(settings(), Arc::clone(&store));

    session.handshake("a@x").await;
    session.send("RCPT TO:<nobody@y>\r\n").await;
    assert_eq!(
        session.read_line().await,
        "550 5.1.1 <nobody@y> User doesn't exist: nobody"
    );
    session.quit().await;
    assert!(store.deliveries().is_empty());
}

// Sequencing errors and the stub verbs.
#[tokio::test]
async fn command_preconditions() {
    let store = Arc::new(RecordingStore::with_users(&["u"]));
    let mut session = Session::start(settings(), Arc::clone(&store));
    assert!(session.read_line().await.starts_with("220 "));

    session.send("RCPT TO:<u@y>\r\n").await;
    assert_eq!(session.read_line().await, "503 5.5.1 MAIL needed first");
    session.send("DATA\r\n").await;
    assert_eq!(session.read_line().await, "503 5.5.1 MAIL needed first");

    session.send("MAIL FROM:<a@x>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.0 OK");
    session.send("MAIL FROM:<b@x>\r\n").await;
    assert_eq!(session.read_line().await, "503 5.5.1 MAIL already given");

    session.send("DATA\r\n").await;
    assert_eq!(session.read_line().await, "554 5.5.1 No valid recipients");

    session.send("MAIL FROM:oops\r\n").await;
    assert_eq!(session.read_line().await, "503 5.5.1 MAIL already given");
    session.send("RSET\r\n").await;
    assert_eq!(session.read_line().await, "250 2.0.0 OK");
    session.send("MAIL FROM:oops\r\n").await;
    assert_eq!(session.read_line().await, "501 5.5.4 Invalid parameters");
    session.send("MAIL FROM:<a@x> FUTURE=1\r\n").await;
    assert_eq!(session.read_line().await, "501 5.5.4 Unsupported options");

    session.send("NOOP\r\n").await;
    assert_eq!(session.read_line().await, "250 2.0.0 OK");
    session.send("VRFY u\r\n").await;
    assert_eq!(session.read_line().await, "252 2.3.3 Try RCPT instead");
    session.send("BLURB\r\n").await;
    assert_eq!(session.read_line().await, "502 5.5.2 Unknown command");
    session.send("XCLIENT ADDR=10.0.0.1\r\n").await;
    assert_eq!(session.read_line().await, "550 You are not from trusted IP");
    session.send("STARTTLS\r\n").await;
    assert_eq!(
        session.read_line().await,
        "454 4.7.0 Internal error, TLS not available."
    );
    session.quit().await;
}

// Pipelined commands are answered in submission order (property 1
// riding along: one final reply per accepted RCPT).
#[tokio::test]
async fn pipelined_commands() {
    let store = Arc::new(RecordingStore::with_users(&["u", "v"]));
    let mut session = Session::start(settings(), Arc::clone(&store));
    assert!(session.read_line().await.starts_with("220 "));

    session
        .send(
            "LHLO host\r\nMAIL FROM:<a@x>\r\nRCPT TO:<u@y>\r\nRCPT TO:<v@y>\r\nDATA\r\nbody\r\n.\r\nQUIT\r\n",
        )
        .await;
    session.read_capabilities().await;
    assert_eq!(session.read_line().await, "250 2.1.0 OK");
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    assert_eq!(session.read_line().await, "354 OK");
    let first = session.read_line().await;
    let second = session.read_line().await;
    assert!(first.starts_with("250 2.0.0 <u@y> "), "{first}");
    assert!(second.starts_with("250 2.0.0 <v@y> "), "{second}");
    assert_eq!(session.read_line().await, "221 2.0.0 OK");

    let deliveries = store.deliveries();
    assert_eq!(deliveries.len(), 2);
    // recipient session ids: first inherits, second appends :2
    assert_eq!(
        deliveries[1].session_id,
        format!("{}:2", deliveries[0].session_id)
    );
    // the first save is offered back as a hard-link source
    assert!(!deliveries[0].had_src_mail);
    assert!(deliveries[1].had_src_mail);
    session.task.await.unwrap().unwrap();
}

// S3: proxied and local recipients cannot mix (property 7).
#[tokio::test]
async fn class_mixing_rejected() {
    let mut settings = settings();
    settings.lmtp_proxy = true;
    settings.users.insert(
        "remote".to_string(),
        proxied_user("192.0.2.77", 11024, &[]),
    );
    let store = Arc::new(RecordingStore::with_users(&["local"]));
    let mut session = Session::start(settings, Arc::clone(&store));

    session.handshake("a@x").await;
    session.send("RCPT TO:<remote@y>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    session.send("RCPT TO:<local@y>\r\n").await;
    assert_eq!(
        session.read_line().await,
        "451 4.3.0 <local@y> Can't handle mixed proxy/non-proxy destinations"
    );
    session.quit().await;
}

// The reverse direction: a local recipient locks out proxying.
#[tokio::test]
async fn class_mixing_rejected_proxy_second() {
    let mut settings = settings();
    settings.lmtp_proxy = true;
    settings
        .users
        .insert("remote".to_string(), proxied_user("192.0.2.77", 11024, &[]));
    let store = Arc::new(RecordingStore::with_users(&["local"]));
    let mut session = Session::start(settings, Arc::clone(&store));

    session.handshake("a@x").await;
    session.send("RCPT TO:<local@y>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    session.send("RCPT TO:<remote@y>\r\n").await;
    assert_eq!(
        session.read_line().await,
        "451 4.3.0 <remote@y> Can't handle mixed proxy/non-proxy destinations"
    );
    session.quit().await;
}

// S4: TTL exhaustion via XCLIENT, answered at RCPT time with no
// outbound connection (property 6).
#[tokio::test]
async fn ttl_exhaustion() {
    let mut settings = settings();
    settings.lmtp_proxy = true;
    settings.trusted_networks = vec!["192.0.2.9".to_string()];
    settings
        .users
        .insert("remote".to_string(), proxied_user("192.0.2.77", 11024, &[]));
    let store = Arc::new(RecordingStore::default());
    let mut session = Session::start(settings, store);

    assert!(session.read_line().await.starts_with("220 "));
    session.send("LHLO host\r\n").await;
    let caps = session.read_capabilities().await;
    assert!(caps.contains(&"250-XCLIENT ADDR PORT TTL TIMEOUT".to_string()));

    session.send("XCLIENT TTL=1\r\n").await;
    assert!(session.read_line().await.starts_with("220 "));

    session.send("MAIL FROM:<a@x>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.0 OK");
    session.send("RCPT TO:<remote@y>\r\n").await;
    assert_eq!(
        session.read_line().await,
        "554 5.4.6 <remote> Proxying appears to be looping (TTL=0)"
    );
    session.quit().await;
}

// Proxying to our own address and port is refused outright.
#[tokio::test]
async fn proxy_to_self_rejected() {
    let mut settings = settings();
    settings.lmtp_proxy = true;
    // the session's local endpoint is 192.0.2.1:24
    settings
        .users
        .insert("remote".to_string(), proxied_user("192.0.2.1", 24, &[]));
    let store = Arc::new(RecordingStore::default());
    let mut session = Session::start(settings, store);

    session.handshake("a@x").await;
    session.send("RCPT TO:<remote@y>\r\n").await;
    assert_eq!(
        session.read_line().await,
        "554 5.4.6 <remote@y> Proxying loops to itself"
    );
    session.quit().await;
}

// A directory failure is a temporary per-recipient error.
#[tokio::test]
async fn directory_failure_is_transient() {
    let mut settings = settings();
    settings.lmtp_proxy = true;
    let store = Arc::new(RecordingStore::with_users(&["u"]));
    let mut session =
        Session::start_with_directory(settings, store, Arc::new(FailingDirectory));

    session.handshake("a@x").await;
    session.send("RCPT TO:<u@y>\r\n").await;
    assert_eq!(
        session.read_line().await,
        "451 4.3.0 <u@y> Temporary user lookup failure"
    );
    // the session survives
    session.send("NOOP\r\n").await;
    assert_eq!(session.read_line().await, "250 2.0.0 OK");
    session.quit().await;
}

// S5: the concurrency gate consults the broker and registers the
// delivery once accepted.
#[tokio::test]
async fn concurrency_limit() {
    let base_dir = tempfile::tempdir().unwrap();
    let listener = UnixListener::bind(base_dir.path().join("anvil")).unwrap();
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufStream::new(stream);
        let mut lookup_replies = vec!["1\n", "2\n"];
        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            if line.starts_with("LOOKUP\t") {
                let reply = lookup_replies.pop().expect("more LOOKUPs than scripted");
                stream.write_all(reply.as_bytes()).await.unwrap();
                stream.flush().await.unwrap();
            }
            seen_tx.send(line).unwrap();
        }
    });

    let mut settings = settings();
    settings.lmtp_user_concurrency_limit = 2;
    settings.base_dir = base_dir.path().to_path_buf();
    let store = Arc::new(RecordingStore::with_users(&["u", "v"]));
    let mut session = Session::start(settings, store);

    session.handshake("a@x").await;

    // broker says 2 parallel deliveries: at the limit, rejected
    session.send("RCPT TO:<u@y>\r\n").await;
    assert_eq!(
        session.read_line().await,
        "451 4.3.0 <u@y> Too many concurrent deliveries for user"
    );
    assert_eq!(seen_rx.recv().await.unwrap(), "LOOKUP\tlmtp/u\n");

    // broker says 1: accepted and registered
    session.send("RCPT TO:<v@y>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    assert_eq!(seen_rx.recv().await.unwrap(), "LOOKUP\tlmtp/v\n");
    assert_eq!(
        seen_rx.recv().await.unwrap(),
        format!("CONNECT\t{}\tlmtp/v\n", std::process::id())
    );
    session.quit().await;
}

// S6: a body larger than the in-memory threshold spills to disk and
// still arrives intact, dot-stuffing undone.
#[tokio::test]
async fn spool_promotion_keeps_bytes_intact() {
    let spool_dir = tempfile::tempdir().unwrap();
    let mut settings = settings();
    settings.spool_dir = spool_dir.path().to_path_buf();
    let store = Arc::new(RecordingStore::with_users(&["u"]));
    let mut session = Session::start(settings, Arc::clone(&store));

    session.handshake("a@x").await;
    session.send("RCPT TO:<u@y>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    session.send("DATA\r\n").await;
    assert_eq!(session.read_line().await, "354 OK");

    let mut wire = String::from("Subject: big\r\n\r\n");
    let mut expected_body = wire.clone();
    for n in 0..2000 {
        // lines starting with a dot go out stuffed
        let line = format!(".line {n} {}\r\n", "x".repeat(30));
        wire.push('.');
        wire.push_str(&line);
        expected_body.push_str(&line);
    }
    assert!(expected_body.len() > 64 * 1024);
    wire.push_str(".\r\n");
    session.send(&wire).await;

    let reply = session.read_line().await;
    assert!(reply.starts_with("250 2.0.0 <u@y> "), "{reply}");
    session.quit().await;

    let deliveries = store.deliveries();
    let body = String::from_utf8(deliveries[0].body.clone()).unwrap();
    let stored_body = body.split_once("Subject: big\r\n").unwrap().1;
    assert_eq!(
        format!("Subject: big\r\n{stored_body}"),
        expected_body,
        "delivered bytes must match the submitted ones"
    );
    // nothing visible is left behind in the spool directory
    assert_eq!(std::fs::read_dir(spool_dir.path()).unwrap().count(), 0);
}

struct UpstreamScript {
    lmtp: bool,
    rcpt_replies: Vec<&'static str>,
    data_replies: Vec<&'static str>,
    delay_data: Option<std::time::Duration>,
}

/// A scripted upstream destination. Returns the port it listens on
/// and a task producing everything it read.
async fn spawn_upstream(script: UpstreamScript) -> (u16, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufStream::new(stream);
        let mut inbound = String::new();

        stream.write_all(b"220 upstream ready\r\n").await.unwrap();
        stream.flush().await.unwrap();

        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        inbound.push_str(&line);
        assert!(line.starts_with(if script.lmtp { "LHLO " } else { "EHLO " }));
        stream
            .write_all(b"250-upstream\r\n250 PIPELINING\r\n")
            .await
            .unwrap();
        stream.flush().await.unwrap();

        line.clear();
        stream.read_line(&mut line).await.unwrap();
        inbound.push_str(&line);
        assert!(line.starts_with("MAIL FROM:"));
        stream.write_all(b"250 2.1.0 OK\r\n").await.unwrap();
        stream.flush().await.unwrap();

        for reply in &script.rcpt_replies {
            line.clear();
            stream.read_line(&mut line).await.unwrap();
            inbound.push_str(&line);
            assert!(line.starts_with("RCPT TO:"), "{line}");
            stream
                .write_all(format!("{reply}\r\n").as_bytes())
                .await
                .unwrap();
        }
        stream.flush().await.unwrap();

        line.clear();
        stream.read_line(&mut line).await.unwrap();
        inbound.push_str(&line);
        if line != "DATA\r\n" {
            // every RCPT was rejected; the client moved on
            return inbound;
        }
        stream.write_all(b"354 go ahead\r\n").await.unwrap();
        stream.flush().await.unwrap();

        loop {
            line.clear();
            stream.read_line(&mut line).await.unwrap();
            if line == ".\r\n" {
                break;
            }
            inbound.push_str(&line);
        }

        if let Some(delay) = script.delay_data {
            tokio::time::sleep(delay).await;
        }
        for reply in &script.data_replies {
            stream
                .write_all(format!("{reply}\r\n").as_bytes())
                .await
                .unwrap();
        }
        stream.flush().await.unwrap();

        // QUIT or EOF
        line.clear();
        stream.read_line(&mut line).await.ok();
        inbound
    });
    (port, task)
}

// An accepted proxied transaction end to end over LMTP.
#[tokio::test]
async fn proxy_lmtp_delivery() {
    let (port, upstream) = spawn_upstream(UpstreamScript {
        lmtp: true,
        rcpt_replies: vec!["250 2.1.5 OK"],
        data_replies: vec!["250 2.0.0 <remote@y> Saved"],
        delay_data: None,
    })
    .await;

    let mut settings = settings();
    settings.lmtp_proxy = true;
    settings
        .users
        .insert("remote".to_string(), proxied_user("127.0.0.1", port, &[]));
    let store = Arc::new(RecordingStore::default());
    let mut session = Session::start(settings, store);

    session.handshake("a@x").await;
    session.send("RCPT TO:<remote@y>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    session.send("DATA\r\n").await;
    assert_eq!(session.read_line().await, "354 OK");
    session.send("Subject: t\r\n\r\n..dotted\r\n.\r\n").await;
    assert_eq!(session.read_line().await, "250 2.0.0 <remote@y> Saved");
    session.quit().await;

    let inbound = upstream.await.unwrap();
    assert!(inbound.contains("LHLO mx.example.com\r\n"));
    assert!(inbound.contains("MAIL FROM:<a@x>\r\n"));
    assert!(inbound.contains("RCPT TO:<remote@y>\r\n"));
    // no Return-Path when proxying; Received is ours
    assert!(!inbound.contains("Return-Path:"));
    assert!(inbound.contains("Received: from client.example.org ([192.0.2.9])\r\n"));
    // still stuffed on the upstream wire
    assert!(inbound.contains("..dotted\r\n"));
}

// An upstream RCPT rejection surfaces verbatim as that recipient's
// final reply.
#[tokio::test]
async fn proxy_rcpt_rejection_propagates() {
    let (port, upstream) = spawn_upstream(UpstreamScript {
        lmtp: true,
        rcpt_replies: vec!["550 5.1.1 no such user here"],
        data_replies: vec![],
        delay_data: None,
    })
    .await;

    let mut settings = settings();
    settings.lmtp_proxy = true;
    settings
        .users
        .insert("remote".to_string(), proxied_user("127.0.0.1", port, &[]));
    let store = Arc::new(RecordingStore::default());
    let mut session = Session::start(settings, store);

    session.handshake("a@x").await;
    session.send("RCPT TO:<remote@y>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    session.send("DATA\r\n").await;
    assert_eq!(session.read_line().await, "354 OK");
    session.send("body\r\n.\r\n").await;
    assert_eq!(session.read_line().await, "550 5.1.1 no such user here");
    session.quit().await;
    drop(upstream);
}

// S7: SMTP fan-out shares a single DATA reply between recipients.
#[tokio::test]
async fn proxy_smtp_broadcast() {
    let (port, upstream) = spawn_upstream(UpstreamScript {
        lmtp: false,
        rcpt_replies: vec!["250 2.1.5 OK", "250 2.1.5 OK"],
        data_replies: vec!["250 2.0.0 queued as 42"],
        delay_data: None,
    })
    .await;

    let mut settings = settings();
    settings.lmtp_proxy = true;
    let fields = proxied_user("127.0.0.1", port, &[("protocol", "smtp")]);
    settings.users.insert("one".to_string(), fields.clone());
    settings.users.insert("two".to_string(), fields);
    let store = Arc::new(RecordingStore::default());
    let mut session = Session::start(settings, store);

    session.handshake("a@x").await;
    session.send("RCPT TO:<one@y>\r\nRCPT TO:<two@y>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    session.send("DATA\r\n").await;
    assert_eq!(session.read_line().await, "354 OK");
    session.send("body\r\n.\r\n").await;
    assert_eq!(session.read_line().await, "250 2.0.0 queued as 42");
    assert_eq!(session.read_line().await, "250 2.0.0 queued as 42");
    session.quit().await;

    let inbound = upstream.await.unwrap();
    assert!(inbound.contains("EHLO mx.example.com\r\n"));
    assert!(inbound.contains("RCPT TO:<one@y>\r\n"));
    assert!(inbound.contains("RCPT TO:<two@y>\r\n"));
}

// Property 2: per-recipient DATA replies come back in RCPT order
// even when a slower destination answers last.
#[tokio::test]
async fn proxy_replies_stay_in_rcpt_order() {
    let (slow_port, slow) = spawn_upstream(UpstreamScript {
        lmtp: true,
        rcpt_replies: vec!["250 2.1.5 OK"],
        data_replies: vec!["250 2.0.0 slow saved"],
        delay_data: Some(std::time::Duration::from_millis(300)),
    })
    .await;
    let (fast_port, fast) = spawn_upstream(UpstreamScript {
        lmtp: true,
        rcpt_replies: vec!["250 2.1.5 OK"],
        data_replies: vec!["250 2.0.0 fast saved"],
        delay_data: None,
    })
    .await;

    let mut settings = settings();
    settings.lmtp_proxy = true;
    settings
        .users
        .insert("slow".to_string(), proxied_user("127.0.0.1", slow_port, &[]));
    settings
        .users
        .insert("fast".to_string(), proxied_user("127.0.0.1", fast_port, &[]));
    let store = Arc::new(RecordingStore::default());
    let mut session = Session::start(settings, store);

    session.handshake("a@x").await;
    session.send("RCPT TO:<slow@y>\r\nRCPT TO:<fast@y>\r\n").await;
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    session.send("DATA\r\n").await;
    assert_eq!(session.read_line().await, "354 OK");
    session.send("body\r\n.\r\n").await;
    // the slow destination's recipient was first, so its reply is
    // first even though the fast one answered long before it
    assert_eq!(session.read_line().await, "250 2.0.0 slow saved");
    assert_eq!(session.read_line().await, "250 2.0.0 fast saved");
    session.quit().await;
    drop((slow, fast));
}

// Quota handling: tempfail policy picks 452 over 552.
#[tokio::test]
async fn quota_precheck() {
    let mut settings = settings();
    settings.lmtp_rcpt_check_quota = true;
    let mut store = RecordingStore::with_users(&["full"]);
    store.quota_exceeded.push("full".to_string());
    let store = Arc::new(store);

    let mut session = Session::start(settings.clone(), Arc::clone(&store));
    session.handshake("a@x").await;
    session.send("RCPT TO:<full@y>\r\n").await;
    assert_eq!(
        session.read_line().await,
        "552 5.2.2 <full@y> Quota exceeded (mailbox for user is full)"
    );
    session.quit().await;

    settings.quota_full_tempfail = true;
    let mut session = Session::start(settings, Arc::clone(&store));
    session.handshake("a@x").await;
    session.send("RCPT TO:<full@y>\r\n").await;
    assert_eq!(
        session.read_line().await,
        "452 4.2.2 <full@y> Quota exceeded (mailbox for user is full)"
    );
    session.quit().await;
}

// Detail splitting feeds the detail mailbox and ORCPT feeds the
// delivery address.
#[tokio::test]
async fn detail_and_orcpt() {
    let mut settings = settings();
    settings.recipient_delimiter = "+".to_string();
    settings.lmtp_save_to_detail_mailbox = true;
    let store = Arc::new(RecordingStore::with_users(&["u"]));
    let mut session = Session::start(settings, Arc::clone(&store));

    session.handshake("a@x").await;
    session
        .send("RCPT TO:<u+promo@y> ORCPT=rfc822;orig+40other@y\r\n")
        .await;
    assert_eq!(session.read_line().await, "250 2.1.5 OK");
    session.send("DATA\r\n").await;
    assert_eq!(session.read_line().await, "354 OK");
    session.send("x\r\n.\r\n").await;
    assert!(session.read_line().await.starts_with("250 2.0.0 <u+promo@y> "));
    session.quit().await;

    let deliveries = store.deliveries();
    assert_eq!(deliveries[0].mailbox, "promo");
    // the ORCPT xtext +40 decoded to @ and won as dest_addr
    assert_eq!(deliveries[0].dest_addr, "orig@other@y");
}
