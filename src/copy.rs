use bytes::{BufMut, Bytes, BytesMut};
use easy_error::{Error, ResultExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::trace;

use crate::{
    common::{
        dialers::BoxedStream,
        frames::{MessageReader, MessageWriter},
    },
    config::IoParams,
};

/// Relays between an established tunnel and the outbound socket until the
/// outbound side closes or either leg fails.
///
/// `initial_payload` reaches the socket before any later tunnel message and
/// the first chunk sent back on the tunnel carries `ack` in front of it.
pub async fn copy_bidi(
    reader: &mut dyn MessageReader,
    writer: &mut dyn MessageWriter,
    remote: BoxedStream,
    initial_payload: Bytes,
    ack: [u8; 2],
    params: &IoParams,
) -> Result<(), Error> {
    let (rread, mut rwrite) = tokio::io::split(remote);
    if !initial_payload.is_empty() {
        rwrite
            .write_all(&initial_payload)
            .await
            .context("write initial payload")?;
        rwrite.flush().await.context("flush initial payload")?;
        #[cfg(feature = "metrics")]
        crate::metrics::RELAYED_BYTES
            .with_label_values(&["uplink"])
            .inc_by(initial_payload.len() as u64);
    }

    let (tx, mut rx) = mpsc::channel(params.queue_depth);
    // first failure on either half drops the other, queue included
    let uplink = async {
        tokio::try_join!(
            pump_tunnel(reader, tx),
            drain_batches(&mut rx, &mut rwrite, params.batch_size)
        )
        .map(|_| ())
    };
    let downlink = pump_remote(rread, writer, ack, params.buffer_size);
    tokio::pin!(uplink);
    tokio::pin!(downlink);

    let mut uplink_done = false;
    loop {
        tokio::select! {
            biased;
            ret = &mut downlink => return ret,
            ret = &mut uplink, if !uplink_done => {
                ret?;
                // tunnel closed, keep draining the remote until it closes too
                trace!("tunnel side finished");
                uplink_done = true;
            }
        }
    }
}

async fn pump_tunnel(reader: &mut dyn MessageReader, tx: mpsc::Sender<Bytes>) -> Result<(), Error> {
    while let Some(msg) = reader.recv().await.context("read from tunnel")? {
        if msg.is_empty() {
            continue;
        }
        if tx.send(msg).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Single consumer of the inbound queue. Each pass takes up to `batch_size`
/// queued messages, writes them as one buffer and yields before the next
/// pass. Shuts down the write half once the queue is closed and empty.
pub async fn drain_batches<W>(
    rx: &mut mpsc::Receiver<Bytes>,
    w: &mut W,
    batch_size: usize,
) -> Result<u64, Error>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut batch = BytesMut::new();
    while let Some(first) = rx.recv().await {
        let mut count = 1;
        let buf = if batch_size > 1 {
            batch.clear();
            batch.put_slice(&first);
            while count < batch_size {
                match rx.try_recv() {
                    Ok(msg) => {
                        batch.put_slice(&msg);
                        count += 1;
                    }
                    Err(_) => break,
                }
            }
            &batch[..]
        } else {
            &first[..]
        };
        trace!("writing {} messages, {} bytes", count, buf.len());
        w.write_all(buf).await.context("write to remote")?;
        w.flush().await.context("flush remote")?;
        total += buf.len() as u64;
        #[cfg(feature = "metrics")]
        crate::metrics::RELAYED_BYTES
            .with_label_values(&["uplink"])
            .inc_by(buf.len() as u64);
        tokio::task::yield_now().await;
    }
    w.shutdown().await.context("shutdown remote")?;
    Ok(total)
}

async fn pump_remote<R>(
    mut r: R,
    writer: &mut dyn MessageWriter,
    ack: [u8; 2],
    buffer_size: usize,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut ack = Some(ack);
    loop {
        let len = r.read(&mut buf).await.context("read from remote")?;
        if len == 0 {
            break;
        }
        let msg = match ack.take() {
            Some(ack) => {
                let mut msg = BytesMut::with_capacity(ack.len() + len);
                msg.put_slice(&ack);
                msg.put_slice(&buf[..len]);
                msg.freeze()
            }
            None => Bytes::copy_from_slice(&buf[..len]),
        };
        writer.send(msg).await.context("write to tunnel")?;
        #[cfg(feature = "metrics")]
        crate::metrics::RELAYED_BYTES
            .with_label_values(&["downlink"])
            .inc_by(len as u64);
    }
    writer.close().await.context("close tunnel")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::frames::mocks;
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };
    use test_log::test;

    #[derive(Default)]
    struct RecordingWriter {
        writes: Vec<Vec<u8>>,
        shutdown: bool,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.writes.push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            self.shutdown = true;
            Poll::Ready(Ok(()))
        }
    }

    #[test(tokio::test)]
    async fn burst_is_coalesced() {
        let (tx, mut rx) = mpsc::channel(64);
        for i in 1..=25u8 {
            tx.send(Bytes::from(vec![i, i])).await.unwrap();
        }
        drop(tx);
        let mut w = RecordingWriter::default();
        let total = drain_batches(&mut rx, &mut w, 10).await.unwrap();
        assert_eq!(total, 50);
        assert_eq!(w.writes.len(), 3);
        let expect = |range: std::ops::RangeInclusive<u8>| -> Vec<u8> {
            range.flat_map(|i| [i, i]).collect()
        };
        assert_eq!(w.writes[0], expect(1..=10));
        assert_eq!(w.writes[1], expect(11..=20));
        assert_eq!(w.writes[2], expect(21..=25));
        assert!(w.shutdown);
    }

    #[test(tokio::test)]
    async fn quiet_queue_writes_immediately() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut w = RecordingWriter::default();
        tx.send(Bytes::from_static(b"one")).await.unwrap();
        drop(tx);
        drain_batches(&mut rx, &mut w, 1).await.unwrap();
        assert_eq!(w.writes, vec![b"one".to_vec()]);
    }

    #[test(tokio::test)]
    async fn relay_orders_payload_and_acks_once() {
        let (local, remote) = tokio::io::duplex(1024);
        let (mut reader, mut writer, tx, sent) = mocks::tunnel();
        let params = IoParams::default();

        let relay = tokio::spawn(async move {
            copy_bidi(
                &mut reader,
                &mut writer,
                Box::new(local),
                Bytes::from_static(b"hello "),
                [0, 0],
                &params,
            )
            .await
        });

        tx.send(Bytes::from_static(b"world")).unwrap();
        drop(tx);

        let mut remote = remote;
        let mut got = Vec::new();
        remote.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello world");

        remote.write_all(b"first").await.unwrap();
        remote.flush().await.unwrap();
        // let the first chunk go out on its own
        while sent.messages().is_empty() {
            tokio::task::yield_now().await;
        }
        remote.write_all(b"second").await.unwrap();
        remote.shutdown().await.unwrap();
        drop(remote);

        relay.await.unwrap().unwrap();
        let messages = sent.messages();
        assert_eq!(&messages[0][..], b"\0\0first");
        assert_eq!(&messages[1][..], b"second");
        assert!(sent.is_closed());
    }

    /// Never yields data, refuses every write.
    struct BrokenPipeRemote;

    impl AsyncRead for BrokenPipeRemote {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenPipeRemote {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test(tokio::test)]
    async fn remote_write_failure_ends_relay() {
        let (mut reader, mut writer, tx, _sent) = mocks::tunnel();
        let params = IoParams::default();
        tx.send(Bytes::from_static(b"queued")).unwrap();

        let ret = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            copy_bidi(
                &mut reader,
                &mut writer,
                Box::new(BrokenPipeRemote),
                Bytes::new(),
                [0, 0],
                &params,
            ),
        )
        .await
        .expect("relay still running after remote write failed");
        assert!(ret.is_err());
        // tunnel side is still open
        drop(tx);
    }
}
