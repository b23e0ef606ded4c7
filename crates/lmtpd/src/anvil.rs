//! Client for the anvil concurrency broker: a line protocol over a
//! UNIX socket below the base directory. `LOOKUP` returns the number
//! of parallel deliveries for a user, `CONNECT` registers one and
//! gets no reply.

use anyhow::Context;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

pub const ANVIL_SOCKET_NAME: &str = "anvil";

pub struct AnvilClient {
    stream: Mutex<BufStream<UnixStream>>,
}

impl AnvilClient {
    pub async fn connect(base_dir: &Path) -> anyhow::Result<Self> {
        let path = base_dir.join(ANVIL_SOCKET_NAME);
        let stream = UnixStream::connect(&path)
            .await
            .with_context(|| format!("connecting to anvil at {}", path.display()))?;
        Ok(Self {
            stream: Mutex::new(BufStream::new(stream)),
        })
    }

    /// `LOOKUP\t<service>/<username>` -> decimal count.
    pub async fn lookup(&self, service: &str, username: &str) -> anyhow::Result<u32> {
        let mut stream = self.stream.lock().await;
        let query = format!("LOOKUP\t{service}/{}\n", tab_escape(username));
        stream.write_all(query.as_bytes()).await.context("anvil write")?;
        stream.flush().await.context("anvil flush")?;

        let mut reply = String::new();
        stream.read_line(&mut reply).await.context("anvil read")?;
        let reply = reply.trim_end();
        reply
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("invalid reply from anvil: {reply:?}"))
    }

    /// `CONNECT\t<pid>\t<service>/<username>`; fire and forget.
    pub async fn register_connect(&self, service: &str, username: &str) -> anyhow::Result<()> {
        let mut stream = self.stream.lock().await;
        let message = format!(
            "CONNECT\t{}\t{service}/{}\n",
            std::process::id(),
            tab_escape(username)
        );
        stream
            .write_all(message.as_bytes())
            .await
            .context("anvil write")?;
        stream.flush().await.context("anvil flush")?;
        Ok(())
    }
}

/// Control characters that would break the tab-separated wire format
/// are escaped behind \x01.
pub fn tab_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\x01' => escaped.push_str("\x011"),
            '\t' => escaped.push_str("\x01t"),
            '\n' => escaped.push_str("\x01n"),
            '\r' => escaped.push_str("\x01r"),
            c => escaped.push(c),
        }
    }
    escaped
}
