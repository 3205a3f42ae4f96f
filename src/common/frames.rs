use async_trait::async_trait;
use bytes::Bytes;
use std::io::Result as IoResult;

/// Inbound half of a message oriented tunnel.
#[async_trait]
pub trait MessageReader: Send {
    /// Next message, `None` once the peer closed the tunnel.
    async fn recv(&mut self) -> IoResult<Option<Bytes>>;
}

/// Outbound half of a message oriented tunnel.
#[async_trait]
pub trait MessageWriter: Send {
    async fn send(&mut self, msg: Bytes) -> IoResult<()>;
    async fn close(&mut self) -> IoResult<()>;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    pub struct MockReader {
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    #[async_trait]
    impl MessageReader for MockReader {
        async fn recv(&mut self) -> IoResult<Option<Bytes>> {
            Ok(self.rx.recv().await)
        }
    }

    #[derive(Clone, Default)]
    pub struct Sent {
        pub messages: Arc<Mutex<Vec<Bytes>>>,
        pub closed: Arc<Mutex<bool>>,
        pub notify: Arc<tokio::sync::Notify>,
    }

    impl Sent {
        pub fn messages(&self) -> Vec<Bytes> {
            self.messages.lock().unwrap().clone()
        }
        pub fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }
    }

    pub struct MockWriter {
        sent: Sent,
    }

    #[async_trait]
    impl MessageWriter for MockWriter {
        async fn send(&mut self, msg: Bytes) -> IoResult<()> {
            if self.sent.is_closed() {
                return Err(IoError::new(ErrorKind::BrokenPipe, "tunnel closed"));
            }
            self.sent.messages.lock().unwrap().push(msg);
            self.sent.notify.notify_waiters();
            Ok(())
        }
        async fn close(&mut self) -> IoResult<()> {
            *self.sent.closed.lock().unwrap() = true;
            self.sent.notify.notify_waiters();
            Ok(())
        }
    }

    /// Returns the tunnel halves, a handle to feed inbound messages and a
    /// handle observing everything written back.
    pub fn tunnel() -> (MockReader, MockWriter, mpsc::UnboundedSender<Bytes>, Sent) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Sent::default();
        (
            MockReader { rx },
            MockWriter { sent: sent.clone() },
            tx,
            sent,
        )
    }
}
