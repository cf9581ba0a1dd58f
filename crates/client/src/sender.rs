//! Outbound half of the protocol: one writer loop per (agent, cycle).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use opamp_protocol::encode_message;
use opamp_protocol::messages::{AgentToServer, InstanceUid};
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::SharedSink;
use crate::error::SenderError;

/// Bound on non-status messages waiting for transmission.
const QUEUE_CAPACITY: usize = 64;

/// One message waiting in the outbound queue.
///
/// Status reports coalesce: only the most recent one is kept, in place, so
/// unrelated messages keep their order around it. Every status is a full
/// state snapshot, which makes the replacement lossless.
enum Outbound {
    Status(AgentToServer),
    Custom {
        message: AgentToServer,
        delivered: oneshot::Sender<()>,
    },
}

/// Sends the agent's portion of the protocol over a live connection.
///
/// Created once per agent at prepare time; `start` binds it to the current
/// cycle's connection and spawns the writer loop. A write error terminates
/// the loop without retrying; reconnecting is the supervisor's job.
pub(crate) struct WsSender {
    instance_uid: InstanceUid,
    queue: Mutex<VecDeque<Outbound>>,
    queue_notify: Notify,
    sequence_num: AtomicU64,
    stopped: Mutex<CancellationToken>,
    stopping_err: Mutex<Option<SenderError>>,
}

impl WsSender {
    pub(crate) fn new(instance_uid: InstanceUid) -> Self {
        Self {
            instance_uid,
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            sequence_num: AtomicU64::new(0),
            stopped: Mutex::new(CancellationToken::new()),
            stopping_err: Mutex::new(None),
        }
    }

    /// Enqueues a status report, replacing a pending one in place.
    pub(crate) fn schedule_status(&self, message: AgentToServer) {
        let mut queue = self.lock_queue();
        match queue
            .iter_mut()
            .find_map(|m| match m {
                Outbound::Status(pending) => Some(pending),
                Outbound::Custom { .. } => None,
            }) {
            Some(pending) => *pending = message,
            None => queue.push_back(Outbound::Status(message)),
        }
        drop(queue);
        self.queue_notify.notify_one();
    }

    /// Enqueues a non-coalescing message. The returned signal fires once the
    /// message has been written to the socket.
    pub(crate) fn schedule_custom(
        &self,
        message: AgentToServer,
    ) -> Result<oneshot::Receiver<()>, crate::error::ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut queue = self.lock_queue();
        if queue.len() >= QUEUE_CAPACITY {
            return Err(crate::error::ClientError::QueueFull);
        }
        queue.push_back(Outbound::Custom {
            message,
            delivered: tx,
        });
        drop(queue);
        self.queue_notify.notify_one();
        Ok(rx)
    }

    /// Signal that fires after the writer loop of the current cycle exits.
    pub(crate) fn stopped(&self) -> CancellationToken {
        self.stopped.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Terminal error of the writer loop, if it did not shut down cleanly.
    pub(crate) fn stopping_err(&self) -> Option<SenderError> {
        self.stopping_err
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Binds the sender to a connection and spawns the writer loop.
    ///
    /// The pending first status report is written before the loop starts; a
    /// failure is returned as `SendFailed` and no loop is spawned.
    pub(crate) async fn start<Si>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        sink: SharedSink<Si>,
        heartbeat: Option<Duration>,
    ) -> Result<(), SenderError>
    where
        Si: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
    {
        *self
            .stopping_err
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        let stopped = CancellationToken::new();
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = stopped.clone();

        if let Some(first) = self.take_pending_status() {
            let frame = match self.encode(first) {
                Ok(frame) => frame,
                Err(err) => {
                    stopped.cancel();
                    return Err(err);
                }
            };
            let mut guard = sink.lock().await;
            if let Err(err) = guard.send(Message::Binary(frame)).await {
                drop(guard);
                stopped.cancel();
                return Err(SenderError::SendFailed(err.to_string()));
            }
        }

        let sender = Arc::clone(self);
        tokio::spawn(writer_loop(sender, cancel, sink, heartbeat, stopped));
        Ok(())
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Outbound>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn has_pending_status(&self) -> bool {
        self.lock_queue()
            .iter()
            .any(|m| matches!(m, Outbound::Status(_)))
    }

    fn take_pending_status(&self) -> Option<AgentToServer> {
        let mut queue = self.lock_queue();
        let index = queue
            .iter()
            .position(|m| matches!(m, Outbound::Status(_)))?;
        match queue.remove(index) {
            Some(Outbound::Status(message)) => Some(message),
            _ => None,
        }
    }

    async fn next_outbound(&self) -> Outbound {
        loop {
            if let Some(message) = self.lock_queue().pop_front() {
                return message;
            }
            self.queue_notify.notified().await;
        }
    }

    fn encode(&self, mut message: AgentToServer) -> Result<Vec<u8>, SenderError> {
        message.sequence_num = self.sequence_num.fetch_add(1, Ordering::Relaxed) + 1;
        encode_message(&message).map_err(|e| SenderError::SendFailed(e.to_string()))
    }

    fn record_stopping_err(&self, err: SenderError) {
        *self
            .stopping_err
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(err);
    }
}

async fn writer_loop<Si>(
    sender: Arc<WsSender>,
    cancel: CancellationToken,
    sink: SharedSink<Si>,
    heartbeat: Option<Duration>,
    stopped: CancellationToken,
) where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    let mut ticker = heartbeat.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Initiate the close handshake; the receiver drains the
                // server's close frame.
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                }));
                let _ = sink.lock().await.send(close).await;
                debug!(agent = %sender.instance_uid, "sender cancelled, close frame sent");
                break;
            }

            outbound = sender.next_outbound() => {
                let (message, delivered) = match outbound {
                    Outbound::Status(message) => (message, None),
                    Outbound::Custom { message, delivered } => (message, Some(delivered)),
                };
                let frame = match sender.encode(message) {
                    Ok(frame) => frame,
                    Err(err) => {
                        sender.record_stopping_err(err);
                        break;
                    }
                };
                if let Err(err) = sink.lock().await.send(Message::Binary(frame)).await {
                    sender.record_stopping_err(SenderError::SendFailed(err.to_string()));
                    break;
                }
                if let Some(delivered) = delivered {
                    let _ = delivered.send(());
                }
            }

            _ = heartbeat_tick(&mut ticker) => {
                // A pending status already proves liveness; only fill the gap.
                if !sender.has_pending_status() {
                    sender.schedule_status(AgentToServer {
                        instance_uid: Some(sender.instance_uid),
                        ..Default::default()
                    });
                }
            }
        }
    }

    stopped.cancel();
}

async fn heartbeat_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
