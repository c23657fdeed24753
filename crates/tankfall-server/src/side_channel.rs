use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tankfall_core::frame::{FrameAccumulator, READ_CHUNK_SIZE};
use tankfall_core::participant::ParticipantId;

use crate::config::SideChannelConfig;
use crate::error::SideChannelError;

/// Where a side-channel listener is in its accept/read cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    Accepted,
    Reading,
    Closed,
}

/// A complete frame observed on a participant's side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub participant_id: ParticipantId,
    /// Frame bytes including the delimiter.
    pub payload: Bytes,
}

/// Doubling delay between retries after I/O errors, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Per-participant TCP echo endpoint.
///
/// Serves one peer at a time. Frames end with `<EOF>` and are echoed back
/// verbatim; partial frames produce nothing. The listener re-arms whenever
/// its peer goes idle or away, and stops (releasing the port) once `cancel`
/// fires.
pub struct SideChannelListener {
    participant_id: ParticipantId,
    listener: TcpListener,
    local_addr: SocketAddr,
    config: SideChannelConfig,
    cancel: CancellationToken,
    state: watch::Sender<ListenerState>,
    frame_sink: Option<mpsc::Sender<ReceivedFrame>>,
}

impl SideChannelListener {
    pub async fn bind(
        participant_id: ParticipantId,
        host: &str,
        port: u16,
        config: SideChannelConfig,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        let (state, _) = watch::channel(ListenerState::Listening);
        tracing::info!(participant_id, %local_addr, "Side channel bound");
        Ok(Self {
            participant_id,
            listener,
            local_addr,
            config,
            cancel,
            state,
            frame_sink: None,
        })
    }

    /// Also report every echoed frame on `sink`. Frames are dropped when the
    /// sink is full; the echo never waits on it.
    pub fn with_frame_sink(mut self, sink: mpsc::Sender<ReceivedFrame>) -> Self {
        self.frame_sink = Some(sink);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_initial_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        );

        loop {
            self.set_state(ListenerState::Listening);
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = tokio::time::timeout(self.config.accept_timeout(), self.listener.accept()) => res,
            };
            let (stream, peer) = match accepted {
                // Nobody connected yet.
                Err(_) => continue,
                Ok(Err(e)) => {
                    tracing::warn!(
                        participant_id = self.participant_id,
                        error = %SideChannelError::Accept(e),
                        "Side channel accept error"
                    );
                    if !self.pause(&mut backoff).await {
                        break;
                    }
                    continue;
                },
                Ok(Ok(pair)) => pair,
            };

            backoff.reset();
            self.set_state(ListenerState::Accepted);
            tracing::info!(participant_id = self.participant_id, %peer, "Side channel peer accepted");

            if !self.serve(stream, &mut backoff).await {
                break;
            }
            tracing::debug!(participant_id = self.participant_id, %peer, "Side channel re-arming");
        }

        self.set_state(ListenerState::Closed);
        tracing::info!(
            participant_id = self.participant_id,
            addr = %self.local_addr,
            "Side channel closed"
        );
    }

    /// Echo frames until the peer leaves or goes idle. Returns false once
    /// cancelled.
    async fn serve(&self, mut stream: TcpStream, backoff: &mut Backoff) -> bool {
        let mut frames = FrameAccumulator::new(self.config.max_frame_bytes);
        let mut buf = [0u8; READ_CHUNK_SIZE];

        loop {
            self.set_state(ListenerState::Reading);
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                res = tokio::time::timeout(self.config.idle_timeout(), stream.read(&mut buf)) => res,
            };
            let n = match read {
                Err(_) => {
                    tracing::debug!(participant_id = self.participant_id, "Side channel peer idle");
                    return true;
                },
                Ok(Ok(0)) => return true,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    tracing::warn!(
                        participant_id = self.participant_id,
                        error = %SideChannelError::Read(e),
                        "Side channel read error"
                    );
                    return self.pause(backoff).await;
                },
            };

            for item in frames.push(&buf[..n]) {
                let frame = match item {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(
                            participant_id = self.participant_id,
                            error = %SideChannelError::from(e),
                            "Discarding side channel frame"
                        );
                        continue;
                    },
                };
                if let Err(e) = self.echo(&mut stream, &frame).await {
                    tracing::warn!(participant_id = self.participant_id, error = %e, "Side channel echo error");
                    return self.pause(backoff).await;
                }
                tracing::trace!(participant_id = self.participant_id, len = frame.len(), "Echoed frame");
                self.report(frame);
            }
        }
    }

    async fn echo(&self, stream: &mut TcpStream, frame: &[u8]) -> Result<(), SideChannelError> {
        match tokio::time::timeout(self.config.write_timeout(), stream.write_all(frame)).await {
            Err(_) => Err(SideChannelError::WriteTimeout),
            Ok(Err(e)) => Err(SideChannelError::Write(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    fn report(&self, frame: Vec<u8>) {
        let Some(sink) = &self.frame_sink else {
            return;
        };
        let received = ReceivedFrame {
            participant_id: self.participant_id,
            payload: Bytes::from(frame),
        };
        if let Err(TrySendError::Full(_)) = sink.try_send(received) {
            tracing::debug!(participant_id = self.participant_id, "Frame sink full, dropping report");
        }
    }

    /// Sleep out the next backoff step. Returns false if cancelled meanwhile.
    async fn pause(&self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }
}
