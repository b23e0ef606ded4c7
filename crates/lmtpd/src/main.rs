use anyhow::Context;
use clap::{Parser, ValueEnum};
use lmtpd::config::LmtpSettings;
use lmtpd::directory::StaticDirectory;
use lmtpd::maildir::MaildirStore;
use lmtpd::server::LmtpServer;
use lmtpd::RuntimeContext;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

/// LMTP delivery daemon.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Settings file to load. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address from the settings file.
    #[arg(long)]
    listen: Option<String>,

    /// How diagnostic logs render. full, compact and pretty are
    /// intended for human consumption; json outputs machine
    /// readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn init_logging(diag_format: DiagnosticFormat) -> anyhow::Result<()> {
    let layer = fmt::layer().with_writer(std::io::stderr);
    let layer = match diag_format {
        DiagnosticFormat::Pretty => layer.pretty().boxed(),
        DiagnosticFormat::Full => layer.boxed(),
        DiagnosticFormat::Compact => layer.compact().boxed(),
        DiagnosticFormat::Json => layer.json().boxed(),
    };

    let env_filter = EnvFilter::try_new(
        std::env::var("LMTPD_LOG")
            .as_deref()
            .unwrap_or("lmtpd=info,rfc2033=info"),
    )?;
    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .init();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    init_logging(opts.diag_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(run(opts))
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let mut settings = match &opts.config {
        Some(path) => LmtpSettings::load(path)?,
        None => LmtpSettings::default(),
    };
    if let Some(listen) = opts.listen {
        settings.listen = listen;
    }

    let tls = match (&settings.tls_certificate, &settings.tls_private_key) {
        (Some(cert), Some(key)) => Some(TlsAcceptor::from(lmtpd::tls::make_server_config(
            cert, key,
        )?)),
        (None, None) => None,
        _ => anyhow::bail!("tls_certificate and tls_private_key must be set together"),
    };

    let store = Arc::new(MaildirStore::new(&settings.mail_root, settings.users.clone()));
    let directory = Arc::new(StaticDirectory::new(settings.users.clone()));
    let ctx = Arc::new(RuntimeContext::new(settings, store, directory, tls));

    let listener = TcpListener::bind(&ctx.settings.listen)
        .await
        .with_context(|| format!("binding {}", ctx.settings.listen))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept")?;
                let local = stream.local_addr().context("local_addr")?;
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(err) = LmtpServer::run(stream, ctx, local, peer).await {
                        tracing::error!("session from {peer} failed: {err:#}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested, exiting");
                return Ok(());
            }
        }
    }
}
