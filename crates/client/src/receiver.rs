//! Inbound half of the protocol: one reader loop per (agent, cycle).

use futures_util::{Stream, StreamExt};
use opamp_protocol::decode_message;
use opamp_protocol::messages::ServerToAgent;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::connection::SharedStream;
use crate::processor::ReceivedProcessor;

/// Reads frames off the connection, decodes them, and hands them to the
/// processor.
///
/// The reader's cancel token is rooted independently of the cycle so the
/// loop can keep draining frames, including the server's close frame, after
/// the cycle itself is torn down. The loop also exits on socket close or on
/// any read or decode error.
pub(crate) struct WsReceiver {
    processor: ReceivedProcessor,
    stopped: CancellationToken,
}

impl WsReceiver {
    pub(crate) fn new(processor: ReceivedProcessor) -> Self {
        Self {
            processor,
            stopped: CancellationToken::new(),
        }
    }

    /// Signal that fires after the reader loop exits.
    pub(crate) fn stopped(&self) -> CancellationToken {
        self.stopped.clone()
    }

    /// Spawns the reader loop.
    pub(crate) fn start<St>(self, cancel: CancellationToken, stream: SharedStream<St>)
    where
        St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
    {
        tokio::spawn(receiver_loop(self, cancel, stream));
    }
}

async fn receiver_loop<St>(
    receiver: WsReceiver,
    cancel: CancellationToken,
    stream: SharedStream<St>,
) where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = next_frame(&stream) => frame,
        };

        match frame {
            Some(Ok(Message::Binary(bytes))) => match decode_message::<ServerToAgent>(&bytes) {
                Ok(message) => {
                    receiver
                        .processor
                        .process_received_message(&message)
                        .await;
                }
                Err(err) => {
                    error!("cannot decode received message: {err}");
                    break;
                }
            },
            // The server completed (or initiated) the close handshake.
            Some(Ok(Message::Close(_))) => break,
            // Control frames carry nothing to dispatch.
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                if !is_normal_close(&err) {
                    error!("unexpected error while receiving: {err}");
                }
                break;
            }
            None => break,
        }
    }

    receiver.stopped.cancel();
}

async fn next_frame<St>(stream: &SharedStream<St>) -> Option<Result<Message, tungstenite::Error>>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    stream.lock().await.next().await
}

fn is_normal_close(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed
    )
}
