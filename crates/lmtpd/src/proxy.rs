//! Outbound fan-out for proxied recipients. One sub-client runs per
//! distinct destination; their per-recipient results are folded back
//! into inbound replies in the order the RCPTs arrived.

use crate::headers::RawMessage;
use crate::resolver::ProxyDestination;
use rfc2033::client::ClientError;
use rfc2033::{Command, EsmtpParameter, LmtpClient, LmtpClientTimeouts, Protocol};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

pub const ERRSTR_TEMP_REMOTE_FAILURE: &str = "451 4.4.0 Remote server not answering";

#[derive(Debug, Clone)]
struct ProxyConnection {
    destination: ProxyDestination,
    /// Inbound RCPT order index per address.
    indexes: Vec<usize>,
    addresses: Vec<String>,
}

/// The per-transaction proxy object, created on the first proxied
/// RCPT. `source_ip`/`source_port` describe the inbound peer so the
/// far side can log the true origin.
#[derive(Debug)]
pub struct LmtpProxy {
    my_hostname: String,
    session_id: String,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub ttl: u32,
    mail_from: Command,
    connections: Vec<ProxyConnection>,
    total: usize,
}

impl LmtpProxy {
    pub fn new(
        my_hostname: String,
        session_id: String,
        source_ip: IpAddr,
        source_port: u16,
        ttl: u32,
        mail_from: String,
        body_param: Option<&str>,
    ) -> Self {
        let parameters = body_param
            .map(|value| {
                vec![EsmtpParameter {
                    name: "BODY".to_string(),
                    value: Some(value.to_string()),
                }]
            })
            .unwrap_or_default();
        Self {
            my_hostname,
            session_id,
            source_ip,
            source_port,
            ttl,
            mail_from: Command::MailFrom {
                address: mail_from,
                parameters,
            },
            connections: vec![],
            total: 0,
        }
    }

    /// Register a recipient, reusing the sub-client for its
    /// destination if one exists. Returns the recipient's position
    /// in overall RCPT order.
    pub fn add_rcpt(&mut self, destination: ProxyDestination, address: String) -> usize {
        let index = self.total;
        self.total += 1;

        match self
            .connections
            .iter_mut()
            .find(|conn| conn.destination == destination)
        {
            Some(conn) => {
                conn.indexes.push(index);
                conn.addresses.push(address);
            }
            None => self.connections.push(ProxyConnection {
                destination,
                indexes: vec![index],
                addresses: vec![address],
            }),
        }
        index
    }

    pub fn rcpt_count(&self) -> usize {
        self.total
    }

    /// Deliver the message to every destination and return one final
    /// reply line per recipient, in RCPT order. Each sub-client runs
    /// under its own timeout; whatever it never answered comes back
    /// as a temporary remote failure.
    pub async fn run(&self, message: &RawMessage) -> Vec<String> {
        let slots: Arc<Mutex<Vec<Option<String>>>> =
            Arc::new(Mutex::new(vec![None; self.total]));

        let mut tasks = JoinSet::new();
        for conn in &self.connections {
            let conn = conn.clone();
            let slots = Arc::clone(&slots);
            let my_hostname = self.my_hostname.clone();
            let mail_from = self.mail_from.clone();
            let message = message.clone();
            let session_id = self.session_id.clone();

            tasks.spawn(async move {
                let deadline = conn.destination.timeout;
                let result = tokio::time::timeout(
                    deadline,
                    run_connection(&conn, &my_hostname, &mail_from, &message, &slots),
                )
                .await;
                if result.is_err() {
                    tracing::error!(
                        "{session_id}: proxy connection to {}:{} timed out after {deadline:?}",
                        conn.destination.host,
                        conn.destination.port
                    );
                }
                let mut slots = slots.lock().expect("slots lock");
                for &index in &conn.indexes {
                    if slots[index].is_none() {
                        slots[index] = Some(format!("{ERRSTR_TEMP_REMOTE_FAILURE} (timeout)"));
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        let slots = slots.lock().expect("slots lock");
        slots
            .iter()
            .map(|slot| {
                slot.clone()
                    .unwrap_or_else(|| ERRSTR_TEMP_REMOTE_FAILURE.to_string())
            })
            .collect()
    }
}

fn error_line(err: &ClientError, phase: &str) -> String {
    match err {
        // a real reply from the far side travels back verbatim
        ClientError::Rejected(response) => response.to_single_line(),
        _ => format!("{ERRSTR_TEMP_REMOTE_FAILURE} ({phase})"),
    }
}

fn fill(slots: &Mutex<Vec<Option<String>>>, indexes: &[usize], line: &str) {
    let mut slots = slots.lock().expect("slots lock");
    for &index in indexes {
        if slots[index].is_none() {
            slots[index] = Some(line.to_string());
        }
    }
}

fn fill_one(slots: &Mutex<Vec<Option<String>>>, index: usize, line: String) {
    let mut slots = slots.lock().expect("slots lock");
    slots[index] = Some(line);
}

async fn run_connection(
    conn: &ProxyConnection,
    my_hostname: &str,
    mail_from: &Command,
    message: &RawMessage,
    slots: &Mutex<Vec<Option<String>>>,
) {
    let destination = &conn.destination;
    let timeouts = LmtpClientTimeouts::from_total(destination.timeout);

    let mut client = match LmtpClient::connect(
        format!("{}:{}", destination.host, destination.port),
        destination.protocol,
        timeouts,
    )
    .await
    {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(
                "proxy: connect({}, {}) failed: {err}",
                destination.host,
                destination.port
            );
            fill(slots, &conn.indexes, &format!("{ERRSTR_TEMP_REMOTE_FAILURE} (connect)"));
            return;
        }
    };

    if let Err(err) = client.handshake(my_hostname, mail_from).await {
        fill(slots, &conn.indexes, &error_line(&err, "handshake"));
        return;
    }

    let rcpt_results = client.pipeline_rcpts(&conn.addresses).await;
    let mut accepted = vec![];
    for (result, &index) in rcpt_results.iter().zip(&conn.indexes) {
        match result {
            Ok(response) if response.is_success() => accepted.push(index),
            Ok(response) => fill_one(slots, index, response.to_single_line()),
            Err(err) => fill_one(slots, index, error_line(err, "rcpt")),
        }
    }
    if accepted.is_empty() {
        client.quit().await;
        return;
    }

    let mut body = message.reader();
    if let Err(err) = client.send_data_stream(&mut body).await {
        fill(slots, &conn.indexes, &error_line(&err, "data"));
        return;
    }

    match destination.protocol {
        Protocol::Lmtp => {
            // one reply per accepted recipient, in order
            for (n, &index) in accepted.iter().enumerate() {
                match client.read_data_reply().await {
                    Ok(response) => fill_one(slots, index, response.to_single_line()),
                    Err(err) => {
                        let line = error_line(&err, "data");
                        for &rest in &accepted[n..] {
                            fill_one(slots, rest, line.clone());
                        }
                        return;
                    }
                }
            }
        }
        Protocol::Smtp => {
            // a single reply covers every recipient
            let line = match client.read_data_reply().await {
                Ok(response) => response.to_single_line(),
                Err(err) => error_line(&err, "data"),
            };
            for &index in &accepted {
                fill_one(slots, index, line.clone());
            }
        }
    }
    client.quit().await;
}
