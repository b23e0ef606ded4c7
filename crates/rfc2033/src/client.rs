use crate::client_types::*;
use crate::command::{Command, Protocol};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

/// Reply lines longer than this are treated as a protocol failure.
pub const MAX_LINE_LEN: usize = 1024;

/// Encoded body bytes are flushed to the socket once this much is
/// pending.
const SEND_HIGH_WATER: usize = 4096;

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Debug + Unpin + Send> AsyncReadAndWrite for T {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Malformed response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {0:?}")]
    Rejected(Response),
    #[error("Timed out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed out writing {command:?} after {duration:?}")]
    TimeOutRequest {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Error {error} reading response to {command:?}")]
    ReadError {
        command: Option<Command>,
        error: String,
    },
    #[error("Error {error} writing {command:?}")]
    WriteError {
        command: Option<Command>,
        error: String,
    },
    #[error("Timed out sending message payload data")]
    TimeOutData,
    #[error("Error {0} sending message payload data")]
    DataWriteError(String),
}

/// Outbound relay client.
///
/// The phases mirror the conversation: connect, `handshake` (banner,
/// LHLO/EHLO, MAIL FROM), `pipeline_rcpts`, then `send_data_stream`
/// followed by one `read_data_reply` per accepted recipient (LMTP)
/// or a single one (SMTP). The caller owns recipient bookkeeping;
/// recipients cannot be added once the body send has begun.
#[derive(Debug)]
pub struct LmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    protocol: Protocol,
    read_buffer: Vec<u8>,
    timeouts: LmtpClientTimeouts,
}

impl LmtpClient {
    pub async fn connect<A: ToSocketAddrs + ToString + Clone>(
        addr: A,
        protocol: Protocol,
        timeouts: LmtpClientTimeouts,
    ) -> std::io::Result<Self> {
        let stream = timeout(timeouts.connect_timeout, TcpStream::connect(addr.clone()))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })??;
        // request/response traffic, no use for Nagle
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(stream, addr.to_string(), protocol, timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        protocol: Protocol,
        timeouts: LmtpClientTimeouts,
    ) -> Self {
        Self {
            socket: Some(Box::new(stream)),
            hostname: peer_hostname.as_ref().to_string(),
            protocol,
            read_buffer: Vec::with_capacity(1024),
            timeouts,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn timeouts(&self) -> &LmtpClientTimeouts {
        &self.timeouts
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }
                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // no complete line yet, go get more
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(ClientError::ReadError {
                            command: cmd.cloned(),
                            error: format!("{err:#}"),
                        });
                    }
                    Err(_) => {
                        self.socket.take();
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        });
                    }
                },
                None => {
                    return Err(ClientError::NotConnected);
                }
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::ReadError {
                    command: cmd.cloned(),
                    error: "Connection closed by peer".to_string(),
                });
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        if let Some(sock) = self.socket.as_mut() {
            if let Err(err) = sock.flush().await {
                self.socket.take();
                return Err(ClientError::WriteError {
                    command: command.cloned(),
                    error: format!("flush: {err:#}"),
                });
            }
        }

        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed =
            parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
        let mut builder = ResponseBuilder::new(&parsed);

        let subsequent_line_timeout = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self.read_line(subsequent_line_timeout, command).await?;
            parsed = parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
            builder
                .add_line(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
        }

        Ok(builder.build())
    }

    async fn write_all_with_timeout(
        &mut self,
        timeout_duration: Duration,
        bytes: &[u8],
        command: Option<&Command>,
    ) -> Result<(), ClientError> {
        match self.socket.as_mut() {
            Some(socket) => match timeout(timeout_duration, socket.write_all(bytes)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    self.socket.take();
                    Err(ClientError::WriteError {
                        command: command.cloned(),
                        error: format!("{err:#}"),
                    })
                }
                Err(_) => {
                    self.socket.take();
                    match command {
                        Some(_) => Err(ClientError::TimeOutRequest {
                            command: command.cloned(),
                            duration: timeout_duration,
                        }),
                        None => Err(ClientError::TimeOutData),
                    }
                }
            },
            None => Err(ClientError::NotConnected),
        }
    }

    async fn write_command(&mut self, command: &Command) -> Result<(), ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {line}", self.hostname);
        let timeout_duration = command.client_timeout_request(&self.timeouts);
        self.write_all_with_timeout(timeout_duration, line.as_bytes(), Some(command))
            .await
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.write_command(command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    /// Read the greeting banner and perform LHLO/EHLO plus MAIL FROM.
    /// The greeting must be 220 and each handshake reply 250.
    pub async fn handshake(
        &mut self,
        my_hostname: &str,
        mail_from: &Command,
    ) -> Result<(), ClientError> {
        let banner = self
            .read_response(None, self.timeouts.connect_timeout)
            .await?;
        if banner.code != 220 {
            return Err(ClientError::Rejected(banner));
        }

        let hello = Command::greeting(self.protocol, my_hostname);
        let response = self.send_command(&hello).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        let response = self.send_command(mail_from).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }
        Ok(())
    }

    /// Send every RCPT TO in one pipelined write, then collect the
    /// replies in order. LMTP servers are required to implement
    /// PIPELINING, so no capability check gates this. The result
    /// vector always has one entry per address; a transport error
    /// partway through is replicated into the remaining slots.
    pub async fn pipeline_rcpts(
        &mut self,
        addresses: &[String],
    ) -> Vec<Result<Response, ClientError>> {
        let commands: Vec<Command> = addresses
            .iter()
            .map(|address| Command::RcptTo {
                address: address.clone(),
                parameters: vec![],
            })
            .collect();

        let mut results: Vec<Result<Response, ClientError>> = vec![];

        let total_timeout: Duration = commands
            .iter()
            .map(|cmd| cmd.client_timeout_request(&self.timeouts))
            .sum();
        let mut all = String::new();
        for cmd in &commands {
            all.push_str(&cmd.encode());
        }
        tracing::trace!("send->{}: (PIPELINE) {all}", self.hostname);

        if let Err(err) = self
            .write_all_with_timeout(total_timeout, all.as_bytes(), commands.first())
            .await
        {
            while results.len() < commands.len() {
                results.push(Err(err.clone()));
            }
            return results;
        }

        for cmd in &commands {
            if results.last().map(|r| r.is_err()).unwrap_or(false) {
                // transport died mid-batch; replicate the error
                let err = results.last().unwrap().as_ref().unwrap_err().clone();
                results.push(Err(err));
                continue;
            }
            results.push(
                self.read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                    .await,
            );
        }
        results
    }

    /// Issue DATA, await the 354 go-ahead, then stream the body with
    /// CRLF normalisation and dot-stuffing, finishing with the
    /// terminating dot. DATA-phase replies are read separately with
    /// [`read_data_reply`](Self::read_data_reply).
    pub async fn send_data_stream<R: AsyncRead + Unpin>(
        &mut self,
        body: &mut R,
    ) -> Result<(), ClientError> {
        let response = self.send_command(&Command::Data).await?;
        if response.code != 354 {
            return Err(ClientError::Rejected(response));
        }

        let mut encoder = DotEncoder::new();
        let mut chunk = [0u8; 8192];
        let mut pending: Vec<u8> = Vec::with_capacity(SEND_HIGH_WATER * 2);
        let timeout_duration = Command::Data.client_timeout_request(&self.timeouts);

        loop {
            let size = body
                .read(&mut chunk)
                .await
                .map_err(|err| ClientError::DataWriteError(format!("reading body: {err:#}")))?;
            if size == 0 {
                break;
            }
            encoder.encode(&chunk[..size], &mut pending);
            if pending.len() >= SEND_HIGH_WATER {
                self.write_all_with_timeout(timeout_duration, &pending, None)
                    .await?;
                pending.clear();
            }
        }
        encoder.finish(&mut pending);
        self.write_all_with_timeout(timeout_duration, &pending, None)
            .await?;
        if let Some(sock) = self.socket.as_mut() {
            if let Err(err) = sock.flush().await {
                self.socket.take();
                return Err(ClientError::DataWriteError(format!("{err:#}")));
            }
        }
        Ok(())
    }

    /// Read one post-DATA reply. In LMTP mode the caller invokes this
    /// once per recipient whose RCPT was accepted; in SMTP mode once
    /// in total.
    pub async fn read_data_reply(&mut self) -> Result<Response, ClientError> {
        let cmd = Command::DataDot;
        self.read_response(Some(&cmd), cmd.client_timeout(&self.timeouts))
            .await
    }

    /// Best-effort QUIT; the connection is dropped either way.
    pub async fn quit(&mut self) {
        self.write_command(&Command::Quit).await.ok();
        if let Some(mut sock) = self.socket.take() {
            sock.flush().await.ok();
        }
    }
}

/// Incremental transmit-side body transform: bare LF becomes CRLF
/// and any line-leading '.' gains a second '.'. `finish` appends the
/// terminating dot line, inserting the missing CRLF when the body
/// did not end with one.
#[derive(Debug)]
pub struct DotEncoder {
    last: u8,
}

impl DotEncoder {
    pub fn new() -> Self {
        // start-of-message counts as start-of-line
        Self { last: b'\n' }
    }

    pub fn encode(&mut self, data: &[u8], out: &mut Vec<u8>) {
        for &b in data {
            match b {
                b'\n' if self.last != b'\r' => {
                    out.extend_from_slice(b"\r\n");
                }
                b'.' if self.last == b'\n' => {
                    out.extend_from_slice(b"..");
                }
                b => out.push(b),
            }
            self.last = b;
        }
    }

    pub fn finish(self, out: &mut Vec<u8>) {
        if self.last != b'\n' {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b".\r\n");
    }
}

impl Default for DotEncoder {
    fn default() -> Self {
        Self::new()
    }
}
