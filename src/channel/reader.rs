//! Read task for one channel.
//!
//! Reads raw bytes from the socket and hands each filled prefix of the
//! buffer to the caller. The read path is the authoritative disconnect
//! detector: a zero-length read, an IO error, or an elapsed read timeout all
//! end the loop and are handed to `on_failure`, which runs the channel's
//! unsolicited-close path. Cancellation (explicit close) ends the loop
//! without calling `on_failure`.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};

/// Parameters fixed once when receiving starts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadSettings {
    pub(crate) buffer_size: usize,
    /// `None` waits indefinitely
    pub(crate) read_timeout: Option<Duration>,
}

/// Spawn the read task.
pub(crate) fn spawn_reader_task<F, E>(
    runtime: &Handle,
    reader: OwnedReadHalf,
    settings: ReadSettings,
    cancel_token: CancellationToken,
    on_receive: F,
    on_failure: E,
) -> JoinHandle<()>
where
    F: FnMut(&[u8]) + Send + 'static,
    E: FnOnce(TransportError) + Send + 'static,
{
    runtime.spawn(async move {
        if let Some(error) = reader_loop(reader, settings, cancel_token, on_receive).await {
            on_failure(error);
        }
    })
}

/// Returns the failure that ended the loop, or `None` when cancelled.
async fn reader_loop<F>(
    mut reader: OwnedReadHalf,
    settings: ReadSettings,
    cancel_token: CancellationToken,
    mut on_receive: F,
) -> Option<TransportError>
where
    F: FnMut(&[u8]),
{
    let mut buffer = vec![0u8; settings.buffer_size];
    loop {
        let result = tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                log::debug!(target: "tcpcom::channel::reader", "Reader cancelled, shutting down");
                return None;
            }

            result = read_once(&mut reader, &mut buffer, settings.read_timeout) => result,
        };

        match result {
            Ok(length) => on_receive(&buffer[..length]),
            Err(e) => {
                log::debug!(target: "tcpcom::channel::reader", "Reader stopped: {}", e);
                return Some(e);
            }
        }
    }
}

/// One read. Only a strictly positive length is a success.
async fn read_once(
    reader: &mut OwnedReadHalf,
    buffer: &mut [u8],
    read_timeout: Option<Duration>,
) -> Result<usize> {
    let read = match read_timeout {
        Some(limit) => tokio::time::timeout(limit, reader.read(buffer))
            .await
            .map_err(|_| TransportError::ReadTimeout(limit))?,
        None => reader.read(buffer).await,
    };

    match read {
        Ok(0) => Err(TransportError::PeerClosed),
        Ok(length) => Ok(length),
        Err(e) => Err(TransportError::Read(e)),
    }
}
