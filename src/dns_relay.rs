use bytes::{Buf, BufMut, Bytes, BytesMut};
use easy_error::{Error, ResultExt};
use tracing::{debug, trace};

use crate::common::{
    doh::DohClient,
    frames::{MessageReader, MessageWriter},
};

/// Forwards length-prefixed DNS queries from the tunnel to a DoH upstream,
/// one at a time, and frames each answer back the same way.
///
/// A failed query is dropped without touching the tunnel. Returns once the
/// tunnel closes.
pub async fn relay_dns(
    reader: &mut dyn MessageReader,
    writer: &mut dyn MessageWriter,
    initial_payload: Bytes,
    ack: [u8; 2],
    doh: &dyn DohClient,
) -> Result<(), Error> {
    let mut pending = BytesMut::new();
    let mut ack = Some(ack);
    let mut next = Some(initial_payload);
    loop {
        let chunk = match next.take() {
            Some(chunk) => chunk,
            None => match reader.recv().await.context("read from tunnel")? {
                Some(msg) => msg,
                None => break,
            },
        };
        pending.put_slice(&chunk);

        while let Some(query) = next_datagram(&mut pending) {
            if query.is_empty() {
                trace!("skipping empty datagram");
                continue;
            }
            let answer = match doh.query(query).await {
                Ok(answer) => answer,
                Err(e) => {
                    debug!("doh query failed: {}", e);
                    #[cfg(feature = "metrics")]
                    crate::metrics::DOH_QUERIES.with_label_values(&["error"]).inc();
                    continue;
                }
            };
            #[cfg(feature = "metrics")]
            crate::metrics::DOH_QUERIES.with_label_values(&["ok"]).inc();
            let Some(msg) = frame_answer(&answer, &mut ack) else {
                debug!("dropping oversized dns answer: {} bytes", answer.len());
                continue;
            };
            writer.send(msg).await.context("write to tunnel")?;
        }
    }
    if !pending.is_empty() {
        trace!("discarding {} bytes of incomplete datagram", pending.len());
    }
    writer.close().await.context("close tunnel")
}

/// Splits one complete datagram off the front of `buf`. Incomplete data is
/// left in place.
fn next_datagram(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return None;
    }
    buf.advance(2);
    Some(buf.split_to(len).freeze())
}

fn frame_answer(answer: &[u8], ack: &mut Option<[u8; 2]>) -> Option<Bytes> {
    let len = u16::try_from(answer.len()).ok()?;
    let mut msg = BytesMut::with_capacity(answer.len() + 4);
    if let Some(ack) = ack.take() {
        msg.put_slice(&ack);
    }
    msg.put_u16(len);
    msg.put_slice(answer);
    Some(msg.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::frames::mocks;
    use async_trait::async_trait;
    use easy_error::err_msg;
    use std::sync::Mutex;
    use test_log::test;

    /// Answers each query with `A` followed by the query bytes, fails
    /// queries starting with `!`.
    #[derive(Default)]
    struct EchoDoh {
        queries: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl DohClient for EchoDoh {
        async fn query(&self, message: Bytes) -> Result<Bytes, Error> {
            self.queries.lock().unwrap().push(message.clone());
            if message.starts_with(b"!") {
                return Err(err_msg("upstream unavailable"));
            }
            let mut ret = BytesMut::from(&b"A"[..]);
            ret.put_slice(&message);
            Ok(ret.freeze())
        }
    }

    fn framed(parts: &[&[u8]]) -> Bytes {
        let mut ret = BytesMut::new();
        for p in parts {
            ret.put_u16(p.len() as u16);
            ret.put_slice(p);
        }
        ret.freeze()
    }

    #[test(tokio::test)]
    async fn two_queries_in_one_message() {
        let (mut reader, mut writer, tx, sent) = mocks::tunnel();
        let doh = EchoDoh::default();
        tx.send(framed(&[b"q1", b"q2"])).unwrap();
        drop(tx);
        relay_dns(&mut reader, &mut writer, Bytes::new(), [0, 0], &doh)
            .await
            .unwrap();

        assert_eq!(doh.queries.lock().unwrap().len(), 2);
        let messages = sent.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[0][..], b"\0\0\0\x03Aq1");
        assert_eq!(&messages[1][..], b"\0\x03Aq2");
        assert!(sent.is_closed());
    }

    #[test(tokio::test)]
    async fn initial_payload_and_split_datagram() {
        let (mut reader, mut writer, tx, sent) = mocks::tunnel();
        let doh = EchoDoh::default();
        let whole = framed(&[b"query"]);
        tx.send(whole.slice(3..)).unwrap();
        drop(tx);
        relay_dns(&mut reader, &mut writer, whole.slice(..3), [7, 0], &doh)
            .await
            .unwrap();

        assert_eq!(&doh.queries.lock().unwrap()[0][..], b"query");
        assert_eq!(&sent.messages()[0][..], b"\x07\0\0\x06Aquery");
    }

    #[test(tokio::test)]
    async fn failed_query_is_skipped() {
        let (mut reader, mut writer, tx, sent) = mocks::tunnel();
        let doh = EchoDoh::default();
        tx.send(framed(&[b"!bad", b"ok"])).unwrap();
        drop(tx);
        relay_dns(&mut reader, &mut writer, Bytes::new(), [0, 0], &doh)
            .await
            .unwrap();

        let messages = sent.messages();
        assert_eq!(messages.len(), 1);
        // the ack goes on the first answer actually delivered
        assert_eq!(&messages[0][..], b"\0\0\0\x03Aok");
    }

    #[test]
    fn oversized_answer_dropped() {
        let mut ack = Some([0, 0]);
        assert!(frame_answer(&vec![0u8; 65536], &mut ack).is_none());
        assert_eq!(ack, Some([0, 0]));
        assert_eq!(frame_answer(&vec![0u8; 65535], &mut ack).unwrap().len(), 65539);
        assert_eq!(ack, None);
    }
}
