//! Client side of the deploy handshake

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::deploy::link::redact;
use crate::deploy::wire::{self, BoundedBuffer, LineStream};
use crate::errors::Xp2pError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap for captured OUT/ERR segment text
pub const BUFFER_LIMIT: usize = 64 * 1024;

/// What the listener reported for one handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployResult {
    /// `EXIT` code, -1 when none was received
    pub exit_code: i32,
    pub link: String,
    pub out_log: String,
    pub err_log: String,
}

impl DeployResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.link.trim().is_empty()
    }
}

/// Connect to `addr` and run one handshake
pub async fn handshake(
    addr: &str,
    token: &str,
    ciphertext: &[u8],
    io_timeout: Duration,
) -> Result<DeployResult, Xp2pError> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Xp2pError::Timeout(format!("connect to {addr}")))??;
    handshake_over(stream, token, ciphertext, io_timeout).await
}

/// Run one handshake over an established stream.
///
/// A server `ERR ...` reply is returned as [`Xp2pError::ProtocolError`].
/// Transport problems, including a close without a reply, surface as I/O
/// or timeout errors.
pub async fn handshake_over<S>(
    stream: S,
    token: &str,
    ciphertext: &[u8],
    io_timeout: Duration,
) -> Result<DeployResult, Xp2pError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = LineStream::new(stream, io_timeout);

    conn.write_line(&format!("{} {}", wire::AUTH, token.trim()))
        .await?;
    match conn.read_line().await? {
        Some(line) if line.starts_with(wire::OK) => {}
        Some(line) => return Err(server_error(&line)),
        None => return Err(closed("connection closed before AUTH response")),
    }

    conn.write_line(&format!("{} {}", wire::MANIFEST_ENC, ciphertext.len()))
        .await?;
    conn.write_bytes(ciphertext).await?;

    let mut result = DeployResult {
        exit_code: -1,
        ..Default::default()
    };
    let mut out = BoundedBuffer::new(BUFFER_LIMIT);
    let mut err = BoundedBuffer::new(BUFFER_LIMIT);

    loop {
        let Some(line) = conn.read_line().await? else {
            return Err(closed("connection closed before DONE"));
        };

        if line == wire::RUN {
            info!("Server started provisioning");
        } else if let Some(code) = line.strip_prefix("EXIT ") {
            match code.trim().parse() {
                Ok(code) => result.exit_code = code,
                Err(_) => warn!("Bad EXIT code {:?}", code),
            }
        } else if line == wire::OUT_BEGIN {
            conn.read_segment(wire::OUT_END, |l| {
                info!(out = l, "server");
                out.append_line(l);
            })
            .await?;
        } else if line == wire::ERR_BEGIN {
            conn.read_segment(wire::ERR_END, |l| {
                warn!(err = l, "server");
                err.append_line(l);
            })
            .await?;
        } else if let Some(link) = line.strip_prefix("LINK ") {
            result.link = link.trim().to_string();
            info!("Connection link received: {}", redact(&result.link));
        } else if line == wire::DONE {
            break;
        } else if line.starts_with("ERR ") {
            return Err(server_error(&line));
        } else {
            debug!("Unhandled deploy line: {}", line);
        }
    }

    result.out_log = out.as_str().to_string();
    result.err_log = err.as_str().to_string();
    Ok(result)
}

/// Peer hung up without replying
fn closed(context: &str) -> Xp2pError {
    Xp2pError::IoError(io::Error::new(io::ErrorKind::UnexpectedEof, context.to_string()))
}

fn server_error(line: &str) -> Xp2pError {
    match line.strip_prefix("ERR ") {
        Some(reason) => Xp2pError::ProtocolError(format!("server error: {}", reason.trim())),
        None => Xp2pError::ProtocolError(format!("unexpected AUTH response: {line:?}")),
    }
}
