//! Per-connection processing
//!
//! A connection runs the upgrade handshake, then drives three concurrent
//! activities over the same stream: the inbound decode-and-dispatch loop,
//! the outbound frame loop, and the application handler. Failure or clean
//! termination of any one of them drives the close handshake, which the
//! others observe at their next suspension point (a queue push/pop or a
//! stream read/write).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{message_channel, MessageReader, MessageWriter};
use crate::error::{Error, Result};
use crate::frame::{encode_frame, FrameParser, OpCode};
use crate::handshake;
use crate::server::{Handler, Registration};
use crate::Config;

/// Subprotocol name → application handler.
pub(crate) type HandlerMap = RwLock<HashMap<String, Handler>>;

/// Writes frames (and the handshake response) to the outbound half of the
/// stream: one write + one flush per logical message. Callers serialize
/// through the mutex in [`Shared`], so two frames' bytes never interleave.
struct FrameWriter<W> {
    io: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    fn new(io: W) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(crate::MAX_FRAME_HEADER_SIZE + 256),
        }
    }

    async fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_frame(&mut self.buf, opcode, payload);
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// State shared by the three concurrent activities of one connection.
struct Shared<W> {
    writer: Mutex<FrameWriter<W>>,
    /// Latched by the first close() caller; later calls are no-ops.
    closing: AtomicBool,
    /// Cancelled once the close sequence has run — the connection's done
    /// flag. Loops exit at their next suspension point.
    done: CancellationToken,
}

impl<W: AsyncWrite + Unpin> Shared<W> {
    /// The CLOSING action of the close handshake.
    ///
    /// Idempotent: only the first caller runs it. Optionally echoes one
    /// empty CLOSE frame, shuts down the outbound half, and marks the
    /// connection done. Teardown errors are logged and swallowed — closing
    /// must not fail on a misbehaving peer.
    async fn close(&self, send_close: bool) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut writer = self.writer.lock().await;
            if send_close {
                if let Err(e) = writer.send(OpCode::Close, &[]).await {
                    debug!(error = %e, "failed to send close frame");
                }
            }
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "failed to shut down output");
            }
        }

        self.done.cancel();
    }

    fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }
}

/// One accepted connection.
///
/// Constructed by the server's accept loop; [`Connection::process`] is
/// spawned under the server's shutdown barrier and runs the connection to
/// completion. Dropping the registration guard deregisters the connection
/// from the server's live set.
pub(crate) struct Connection<S> {
    stream: S,
    config: Config,
    handlers: Arc<HandlerMap>,
    /// Cancelled by `Server::stop()`; observed at the next read suspension
    /// point like an end of stream.
    shutdown_input: CancellationToken,
    _registration: Registration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(crate) fn new(
        stream: S,
        config: Config,
        handlers: Arc<HandlerMap>,
        shutdown_input: CancellationToken,
        registration: Registration,
    ) -> Self {
        Self {
            stream,
            config,
            handlers,
            shutdown_input,
            _registration: registration,
        }
    }

    /// Drive the connection to completion.
    ///
    /// Runs the inbound side (handshake, then handler + decode loop) and
    /// the outbound frame loop concurrently and waits for both. Failures
    /// have already driven the close handshake by the time they surface
    /// here, so they are logged and swallowed.
    pub(crate) async fn process(self) {
        let Connection {
            stream,
            config,
            handlers,
            shutdown_input,
            _registration,
        } = self;

        let (mut read_half, write_half) = tokio::io::split(stream);
        let shared = Shared {
            writer: Mutex::new(FrameWriter::new(write_half)),
            closing: AtomicBool::new(false),
            done: CancellationToken::new(),
        };

        let (outbound_tx, outbound_rx) = message_channel(config.queue_capacity);

        let inbound = read_side(
            &mut read_half,
            &shared,
            &config,
            &handlers,
            &shutdown_input,
            outbound_tx,
        );
        let outbound = write_side(&shared, outbound_rx);

        let (read_result, write_result) = tokio::join!(inbound, outbound);
        if let Err(e) = read_result {
            debug!(error = %e, "connection processing failed");
        }
        if let Err(e) = write_result {
            debug!(error = %e, "connection processing failed");
        }
    }
}

/// Inbound side: handshake, then the application handler and the
/// decode-and-dispatch loop run concurrently until done.
async fn read_side<R, W>(
    reader: &mut R,
    shared: &Shared<W>,
    config: &Config,
    handlers: &HandlerMap,
    shutdown_input: &CancellationToken,
    outbound_tx: MessageWriter,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut fill = BytesMut::with_capacity(config.read_buffer_size);

    let handler = match run_handshake(reader, &mut fill, shared, handlers).await {
        Ok(Some(handler)) => handler,
        Ok(None) => {
            // End of input before a request: idle close, not an error.
            shared.close(false).await;
            return Ok(());
        }
        Err(e) => {
            shared.close(false).await;
            return Err(e);
        }
    };

    let (inbound_tx, inbound_rx) = message_channel(config.queue_capacity);

    let handler_fut = async {
        let result = handler(inbound_rx, outbound_tx).await;
        match &result {
            Ok(()) => {
                // Completion drops the handler's producer end; the outbound
                // loop drains what is queued and then runs the close
                // handshake, so the close frame never overtakes queued data.
                debug!("handler finished");
            }
            Err(e) => {
                debug!(error = %e, "handler failed");
                // Close the input side first so the decode loop unblocks,
                // then propagate.
                shared.close(true).await;
            }
        }
        result
    };

    let decode_fut = decode_loop(reader, &mut fill, shared, shutdown_input, inbound_tx, config);

    let (handler_result, ()) = tokio::join!(handler_fut, decode_fut);
    handler_result
}

/// Run the upgrade handshake: parse one request, negotiate the subprotocol
/// against the handler registry, write the 101 response.
///
/// Returns `None` for an idle close (end of input before a request).
async fn run_handshake<R, W>(
    reader: &mut R,
    fill: &mut BytesMut,
    shared: &Shared<W>,
    handlers: &HandlerMap,
) -> Result<Option<Handler>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = match handshake::read_upgrade_request(reader, fill).await? {
        Some(request) => request,
        None => return Ok(None),
    };

    let subprotocol = request.subprotocol;
    let handler = handlers
        .read()
        .get(&subprotocol)
        .cloned()
        .ok_or(Error::Handshake("subprotocol not supported"))?;
    debug!(subprotocol = %subprotocol, version = %request.version, "negotiated upgrade");

    let accept_key = handshake::generate_accept_key(&request.key);
    let response = handshake::build_response(&accept_key, &subprotocol);
    shared.writer.lock().await.write_raw(&response).await?;

    Ok(Some(handler))
}

/// Decode wire frames and dispatch by opcode until the connection is done.
///
/// Owns the inbound producer end; dropping it on return closes the inbound
/// queue so the handler observes a closed queue instead of hanging.
async fn decode_loop<R, W>(
    reader: &mut R,
    fill: &mut BytesMut,
    shared: &Shared<W>,
    shutdown_input: &CancellationToken,
    inbound_tx: MessageWriter,
    config: &Config,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut parser = FrameParser::new(config.max_frame_size);

    'outer: while !shared.is_done() {
        // Drain complete frames already buffered.
        loop {
            let frame = match parser.parse(fill) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "frame decode failed");
                    shared.close(true).await;
                    break 'outer;
                }
            };

            match frame.opcode() {
                Some(OpCode::Continuation) | Some(OpCode::Text) | Some(OpCode::Binary) => {
                    // Delivered uniformly as data. Suspends while the
                    // inbound queue is full — backpressure toward the peer.
                    tokio::select! {
                        _ = shared.done.cancelled() => break 'outer,
                        sent = inbound_tx.send(frame.payload) => {
                            if sent.is_err() {
                                break 'outer;
                            }
                        }
                    }
                }
                Some(OpCode::Close) => {
                    debug!("received close frame");
                    shared.close(true).await;
                    break 'outer;
                }
                Some(OpCode::Ping) => {
                    debug!("received ping frame");
                    let replied = shared
                        .writer
                        .lock()
                        .await
                        .send(OpCode::Pong, &frame.payload)
                        .await;
                    if let Err(e) = replied {
                        debug!(error = %e, "failed to send pong");
                        shared.close(true).await;
                        break 'outer;
                    }
                }
                Some(OpCode::Pong) => {
                    debug!("received pong frame");
                }
                None => {
                    debug!("ignoring frame with reserved opcode");
                }
            }
        }

        if shared.is_done() {
            break;
        }

        // Need more bytes for the next frame.
        tokio::select! {
            _ = shared.done.cancelled() => break,
            _ = shutdown_input.cancelled() => {
                // Server stop: surfaces like end of stream.
                shared.close(false).await;
                break;
            }
            read = reader.read_buf(fill) => match read {
                Ok(0) => {
                    if parser.is_idle() && fill.is_empty() {
                        // Clean end of stream: no echo.
                        shared.close(false).await;
                    } else {
                        // Truncated frame: abrupt termination.
                        shared.close(true).await;
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "reading from socket failed");
                    shared.close(true).await;
                    break;
                }
            }
        }
    }
}

/// Outbound frame loop: pop payloads off the outbound queue and write them
/// as BINARY frames in strict dequeue order.
async fn write_side<W>(shared: &Shared<W>, mut outbound_rx: MessageReader) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = shared.done.cancelled() => break,
            payload = outbound_rx.recv() => match payload {
                Some(payload) => {
                    let sent = shared
                        .writer
                        .lock()
                        .await
                        .send(OpCode::Binary, &payload)
                        .await;
                    if let Err(e) = sent {
                        shared.close(false).await;
                        return Err(e);
                    }
                }
                None => {
                    // Handler dropped its producer end: the session is over
                    // and everything queued has been written. Idempotent if
                    // another trigger closed first.
                    shared.close(true).await;
                    break;
                }
            }
        }
    }
    Ok(())
}
