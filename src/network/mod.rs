pub mod codec;
pub mod protocol;

use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, tcp::{OwnedReadHalf, OwnedWriteHalf}},
    sync::{mpsc, watch, Mutex},
};
use tokio_util::{codec::{FramedRead, FramedWrite}, sync::CancellationToken};

use codec::LineCodec;
use protocol::Message;

/// Connection state of a session. `Disabled` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Waiting,
    Listening,
    Disabled,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Session was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

type Reader = FramedRead<OwnedReadHalf, LineCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LineCodec>;

/// A line-oriented TCP session with a single peer, either dialled (`connect`) or
/// accepted (`accept`). Incoming lines are tokenized into messages by `receive_loop`,
/// outgoing lines are written by `send`. Both may be used concurrently.
pub struct Session {
    state_tx: watch::Sender<State>,
    state_rx: watch::Receiver<State>,
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    cancel: CancellationToken,
}

impl Session {
    /// Creates a session in `Waiting`. Triggering `cancel` (or calling `close`) stops
    /// connection attempts and the receive loop.
    pub fn new(cancel: &CancellationToken) -> Self {
        let (state_tx, state_rx) = watch::channel(State::Waiting);
        Session {
            state_tx,
            state_rx,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            cancel: cancel.child_token(),
        }
    }

    pub fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state_rx.clone()
    }

    fn disable(&self) {
        if self.state() != State::Disabled {
            log::info!("Session disabled");
            let _ = self.state_tx.send(State::Disabled);
        }
    }

    async fn attach(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        *self.reader.lock().await = Some(FramedRead::new(read, LineCodec::new()));
        *self.writer.lock().await = Some(FramedWrite::new(write, LineCodec::new()));
        if self.state() == State::Disabled {
            return Err(Error::Cancelled);
        }
        let _ = self.state_tx.send(State::Listening);
        Ok(())
    }

    /// Dials `addr` until it succeeds, waiting `retry` between attempts. Only
    /// cancellation ends the retries.
    pub async fn connect(&self, addr: &str, retry: Duration) -> Result<()> {
        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = TcpStream::connect(addr) => Some(result),
            };
            match attempt {
                None => break,
                Some(Ok(stream)) => {
                    log::info!("Connected to {}", addr);
                    return self.attach(stream).await;
                },
                Some(Err(error)) =>
                    log::warn!("Could not connect to {}: {}, retrying in {:?}", addr, error, retry),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(retry) => {},
            }
        }
        self.disable();
        Err(Error::Cancelled)
    }

    /// Accepts exactly one peer on `listener`, which is dropped afterwards.
    pub async fn accept(&self, listener: TcpListener) -> Result<SocketAddr> {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = listener.accept() => result.map_err(Error::from),
        };
        match result {
            Ok((stream, addr)) => {
                log::info!("Accepted connection from {}", addr);
                self.attach(stream).await?;
                Ok(addr)
            },
            Err(error) => {
                self.disable();
                Err(error)
            }
        }
    }

    /// Binds `port` on all interfaces and accepts one peer.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr> {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(error) => {
                self.disable();
                return Err(error.into());
            }
        };
        log::info!("Waiting for a connection on port {}", port);
        self.accept(listener).await
    }

    /// Reads lines until the peer closes the connection, a read fails, or the session is
    /// cancelled, forwarding every recognised message over `tx` in receipt order.
    /// Untagged lines are dropped, malformed messages are logged and dropped, and so are
    /// lines over [`codec::MAX_LINE_LENGTH`]. Invalid UTF-8 is replaced, never fatal. The
    /// session is `Disabled` when this returns.
    pub async fn receive_loop(&self, tx: mpsc::UnboundedSender<Message>) -> Result<()> {
        let mut reader = self.reader.lock().await.take().ok_or(Error::NotConnected)?;
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = reader.next() => line,
            };
            match line {
                Some(Ok(line)) => match Message::parse(&line) {
                    Ok(Some(message)) => if tx.send(message).is_err() {
                        log::debug!("Message receiver dropped");
                        break;
                    },
                    Ok(None) => log::debug!("Dropping untagged line {:?}", line),
                    Err(error) => log::warn!("Dropping malformed message {:?}: {}", line, error),
                },
                Some(Err(error)) => {
                    log::warn!("Could not read from peer: {}", error);
                    break;
                },
                None => {
                    log::info!("Peer closed the connection");
                    break;
                }
            }
        }
        self.disable();
        Ok(())
    }

    /// Writes `line` followed by a newline. There is no retry, a failed write disables
    /// the session.
    pub async fn send(&self, line: &str) -> Result<()> {
        if self.state() != State::Listening {
            return Err(Error::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;
        if let Err(error) = writer.send(line).await {
            self.disable();
            return Err(error.into());
        }
        Ok(())
    }

    /// Writes `bytes` prefixed with their length as a 32-bit big-endian integer.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        if self.state() != State::Listening {
            return Err(Error::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(Error::NotConnected)?.get_mut();
        let result = async {
            stream.write_u32(bytes.len() as u32).await?;
            stream.write_all(bytes).await?;
            stream.flush().await
        }.await;
        if let Err(error) = result {
            self.disable();
            return Err(error.into());
        }
        Ok(())
    }

    /// Shuts the connection down and stops the receive loop.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(writer) = self.writer.lock().await.take() {
            let _ = writer.into_inner().shutdown().await;
        }
        self.disable();
    }
}
