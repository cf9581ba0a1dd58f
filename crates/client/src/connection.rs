//! Shared handle over one WebSocket connection.

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a connection, shared by the sender tasks bound to it.
pub(crate) type SharedSink<Si> = Arc<Mutex<Si>>;

/// Read half of a connection, shared by the receiver tasks bound to it.
pub(crate) type SharedStream<St> = Arc<Mutex<St>>;

/// Owns one WebSocket for the duration of a cycle. The supervisor closes it
/// on cycle exit; sender and receiver tasks only hold the shared halves.
pub(crate) struct Connection {
    sink: SharedSink<SplitSink<WsStream, Message>>,
    stream: SharedStream<SplitStream<WsStream>>,
}

impl Connection {
    pub(crate) fn new(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Arc::new(Mutex::new(sink)),
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    pub(crate) fn sink(&self) -> SharedSink<SplitSink<WsStream, Message>> {
        self.sink.clone()
    }

    pub(crate) fn stream(&self) -> SharedStream<SplitStream<WsStream>> {
        self.stream.clone()
    }

    /// Closes the underlying socket. Also unblocks a receiver stuck in a
    /// read.
    pub(crate) async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}
