use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use gotalk::{Codec, Context, Keepalive, Sock, SockConfig, SockError, SockEvent, StreamEvent, WsConnector};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Sock(#[from] SockError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("read input failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for response")]
    Timeout,
}

#[derive(Parser, Debug)]
#[command(name = "gotalk-cli", about = "Talk to a gotalk responder over WebSocket")]
struct Cli {
    /// Responder address; `ws://` is assumed when no scheme is given.
    #[arg(long, short, env = "GOTALK_ADDR")]
    addr: Option<String>,

    #[arg(long, env = "GOTALK_PROTOCOL", default_value_t = Codec::Binary)]
    protocol: Codec,

    /// Heartbeat interval in milliseconds, 0 disables heartbeats.
    #[arg(long, env = "GOTALK_HEARTBEAT_INTERVAL_MS", default_value_t = 20_000)]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a request and print the response.
    Request(CallArgs),
    /// Send a notification.
    Notify(CallArgs),
    /// Send input lines as a stream request and print the response chunks.
    Stream(StreamArgs),
    /// Stay connected and print notifications and connection events.
    Listen(ListenArgs),
}

#[derive(Args, Debug)]
struct CallArgs {
    name: String,

    #[arg(help = "JSON payload, or raw text with --raw")]
    payload: Option<String>,

    #[arg(long, default_value_t = false)]
    raw: bool,
}

#[derive(Args, Debug)]
struct StreamArgs {
    op: String,

    #[arg(long, default_value = "-", help = "Input file path, or - for stdin")]
    input: String,
}

#[derive(Args, Debug)]
struct ListenArgs {
    #[arg(long, default_value_t = false)]
    heartbeats: bool,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut ctx = Context::from_env();
    ctx.set_sock_config(SockConfig {
        codec: cli.protocol,
        heartbeat_interval: Duration::from_millis(cli.heartbeat_ms),
        ..ctx.sock_config()
    });
    let timeout = Duration::from_millis(cli.timeout_ms);
    let addr = cli.addr.as_deref();

    match cli.command {
        Command::Request(args) => run_request(&ctx, addr, args, timeout).await,
        Command::Notify(args) => run_notify(&ctx, addr, args, timeout).await,
        Command::Stream(args) => run_stream(&ctx, addr, args, timeout).await,
        Command::Listen(args) => run_listen(&ctx, addr, args, timeout).await,
    }
}

async fn run_request(ctx: &Context, addr: Option<&str>, args: CallArgs, timeout: Duration) -> Result<(), CliError> {
    let payload = encode_payload(args.payload.as_deref(), args.raw)?;
    let sock = ctx.open(addr).await?;
    let response = tokio::time::timeout(timeout, sock.buffer_request(&args.name, &payload))
        .await
        .map_err(|_| CliError::Timeout);
    // A timed-out request is still pending, so do not wait for its response.
    finish(&sock, timeout, response.is_err()).await;
    print_payload(&response??, args.raw)
}

async fn run_notify(ctx: &Context, addr: Option<&str>, args: CallArgs, timeout: Duration) -> Result<(), CliError> {
    let payload = encode_payload(args.payload.as_deref(), args.raw)?;
    let sock = ctx.open(addr).await?;
    sock.buffer_notify(&args.name, &payload)?;
    finish(&sock, timeout, false).await;
    Ok(())
}

async fn run_stream(ctx: &Context, addr: Option<&str>, args: StreamArgs, timeout: Duration) -> Result<(), CliError> {
    let reader: Box<dyn AsyncBufRead + Unpin> = if args.input == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        Box::new(BufReader::new(tokio::fs::File::open(&args.input).await?))
    };

    let sock = ctx.open(addr).await?;
    let mut req = sock.stream_request(&args.op)?;
    let mut lines = reader.lines();
    let mut sent = 0_usize;
    while let Some(line) = lines.next_line().await? {
        // An empty chunk would end the request.
        if line.is_empty() {
            continue;
        }
        req.write(line.as_bytes())?;
        sent = sent.saturating_add(1);
    }
    req.end()?;
    eprintln!("sent {sent} chunks to {}", args.op);

    let result = loop {
        let event = tokio::time::timeout(timeout, req.recv()).await.map_err(|_| CliError::Timeout)?;
        match event {
            Some(StreamEvent::Data(chunk)) => print_payload(&chunk, true)?,
            Some(StreamEvent::Close(None)) | None => break Ok(()),
            Some(StreamEvent::Close(Some(e))) => break Err(CliError::Sock(e)),
        }
    };
    drop(req);
    finish(&sock, timeout, false).await;
    result
}

async fn run_listen(ctx: &Context, addr: Option<&str>, args: ListenArgs, timeout: Duration) -> Result<(), CliError> {
    ctx.handle_buffer_notification("", |payload, name| {
        println!("{name}: {}", String::from_utf8_lossy(&payload));
    });

    let addr = ctx.resolve_address(addr)?;
    let sock = ctx.sock();
    let mut events = sock.subscribe();
    let keepalive = Keepalive::new(
        sock.clone(),
        addr.clone(),
        ctx.keepalive_config(),
        Arc::new(WsConnector),
        ctx.net().clone(),
    );
    keepalive.enable();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SockEvent::Open) => eprintln!("connected to {addr}"),
                Ok(SockEvent::Close(None)) => eprintln!("disconnected"),
                Ok(SockEvent::Close(Some(e))) => eprintln!("disconnected: {e}"),
                Ok(SockEvent::Heartbeat { time, load }) => {
                    if args.heartbeats {
                        let secs = time.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
                        eprintln!("heartbeat time={secs} load={load:.3}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event receiver lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    keepalive.disable();
    finish(&sock, timeout, false).await;
    Ok(())
}

/// Close the connection and wait for the close to complete. Unless `force`
/// is set, outstanding responses are waited for first.
async fn finish(sock: &Sock, timeout: Duration, force: bool) {
    if !sock.is_connected() {
        return;
    }
    let mut events = sock.subscribe();
    sock.end();
    if force {
        sock.end();
    }
    let closed = async {
        loop {
            match events.recv().await {
                Ok(SockEvent::Close(_)) | Err(RecvError::Closed) => return,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    };
    if tokio::time::timeout(timeout, closed).await.is_err() {
        tracing::warn!("connection did not close in time");
    }
}

fn encode_payload(payload: Option<&str>, raw: bool) -> Result<Vec<u8>, CliError> {
    match payload {
        None => Ok(Vec::new()),
        Some(text) if raw => Ok(text.as_bytes().to_vec()),
        Some(text) => {
            let value = serde_json::from_str::<Value>(text)?;
            Ok(serde_json::to_vec(&value)?)
        }
    }
}

fn print_payload(bytes: &[u8], raw: bool) -> Result<(), CliError> {
    if !raw {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }
    }
    println!("{}", String::from_utf8_lossy(bytes));
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
