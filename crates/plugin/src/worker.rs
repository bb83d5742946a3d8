//! Child side of the sandbox protocol, for workers written in Rust.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::contract::Plugin;
use crate::protocol::{MAX_MEMORY_ENV, PING_ACTION, Request, error_response, normalize_response};

/// Serves requests from `input` until end of stream.
///
/// `ping` is answered without reaching the plugin. Malformed request lines
/// get an error response and do not stop the loop.
pub async fn serve<R, W>(plugin: &dyn Plugin, input: R, mut output: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) if request.action == PING_ACTION => {
                serde_json::json!({"status": "ok", "pong": true})
            }
            Ok(request) => {
                debug!(action = %request.action, "handling request");
                match plugin.handle(&request.action, request.payload).await {
                    Ok(value) => normalize_response(value),
                    Err(fault) => error_response(fault.to_string(), fault.code()),
                }
            }
            Err(e) => error_response(format!("invalid request: {e}"), "bad_request"),
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        output.write_all(&encoded).await?;
        output.flush().await?;
    }

    Ok(())
}

/// Serves requests on the process's stdin and stdout.
///
/// The memory limit handed down by the host is applied first.
pub async fn serve_stdio(plugin: &dyn Plugin) -> io::Result<()> {
    if let Err(e) = apply_memory_limit() {
        warn!(error = %e, "could not apply the memory limit");
    }
    serve(plugin, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Caps this process's address space at the size named by
/// `PALISADE_MAX_MEMORY_MB`. Returns the applied limit in bytes.
pub fn apply_memory_limit() -> io::Result<Option<u64>> {
    let Ok(raw) = std::env::var(MAX_MEMORY_ENV) else {
        return Ok(None);
    };
    let Some(bytes) = parse_memory_limit(&raw)? else {
        return Ok(None);
    };

    let applied = limit_address_space(bytes)?;
    debug!(bytes = applied, "address space limited");
    Ok(Some(applied))
}

/// Limit in bytes for a `PALISADE_MAX_MEMORY_MB` value; zero means none.
fn parse_memory_limit(raw: &str) -> io::Result<Option<u64>> {
    let megabytes: u64 = raw.trim().parse().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{MAX_MEMORY_ENV}={raw:?} is not a number: {e}"),
        )
    })?;
    Ok((megabytes > 0).then(|| megabytes.saturating_mul(1024 * 1024)))
}

#[cfg(unix)]
fn limit_address_space(bytes: u64) -> io::Result<u64> {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};

    let (_, hard) = getrlimit(Resource::RLIMIT_AS)?;
    let limit = bytes.min(hard);
    setrlimit(Resource::RLIMIT_AS, limit, limit)?;
    Ok(limit)
}

#[cfg(not(unix))]
fn limit_address_space(_bytes: u64) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "address space limits are not supported on this platform",
    ))
}
