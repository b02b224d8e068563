//! In-memory transport: a connected pair of channel-backed endpoints.

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use tether_core::transport::{Transport, TransportError, TransportMessage};

/// One endpoint of an in-memory transport pair.
pub struct MockTransport {
    tx: UnboundedSender<TransportMessage>,
    rx: UnboundedReceiver<TransportMessage>,
    max_message_size: u64,
    use_wbxml: bool,
    closed: bool,
}

impl MockTransport {
    /// Two connected endpoints; what one sends the other receives.
    pub fn pair() -> (MockTransport, MockTransport) {
        let (a_tx, a_rx) = unbounded_channel();
        let (b_tx, b_rx) = unbounded_channel();

        (
            MockTransport {
                tx: a_tx,
                rx: b_rx,
                max_message_size: tether_core::proto::DEFAULT_MAX_MESSAGE_SIZE,
                use_wbxml: false,
                closed: false,
            },
            MockTransport {
                tx: b_tx,
                rx: a_rx,
                max_message_size: tether_core::proto::DEFAULT_MAX_MESSAGE_SIZE,
                use_wbxml: false,
                closed: false,
            },
        )
    }

    pub fn set_max_message_size(&mut self, size: u64) {
        self.max_message_size = size;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn init(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.rx.close();
        Ok(())
    }

    async fn send(&mut self, data: &[u8], content_type: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        debug!(bytes = data.len(), content_type, "mock transport delivering message");
        self.tx
            .send(TransportMessage { data: data.to_vec(), content_type: content_type.to_string() })
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<TransportMessage, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    fn max_message_size(&self) -> u64 {
        self.max_message_size
    }

    fn uses_wbxml(&self) -> bool {
        self.use_wbxml
    }
}
