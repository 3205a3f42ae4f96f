use std::{
    io::{Error as IoError, Result as IoResult},
    net::SocketAddr,
    sync::Arc,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use easy_error::{Error, ResultExt};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        self, Message,
        handshake::server::{ErrorResponse, Request, Response},
        http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
    },
};
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::{
    common::frames::{MessageReader, MessageWriter},
    session::{Gateway, handle_tunnel},
};

pub struct WebSocketListener {
    listener: TcpListener,
    gateway: Arc<Gateway>,
}

impl WebSocketListener {
    pub async fn bind(addr: &str, gateway: Arc<Gateway>) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {}", addr))?;
        info!("listening on {}", addr);
        Ok(Self { listener, gateway })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().context("local_addr")
    }

    /// Accepts forever, one task per connection.
    pub async fn serve(self) {
        loop {
            if let Err(e) = self.accept().await {
                warn!("{}: {:?}", e, e.cause);
            }
        }
    }

    async fn accept(&self) -> Result<(), Error> {
        let (socket, source) = self.listener.accept().await.context("accept")?;
        trace!("connected from {:?}", source);
        socket.set_nodelay(true).context("set_nodelay")?;
        let gateway = self.gateway.clone();
        tokio::spawn(
            async move {
                let (ws, early) = match upgrade(socket).await {
                    Ok(ret) => ret,
                    Err(e) => {
                        debug!("{}: {:?}", e, e.cause);
                        return;
                    }
                };
                let (sink, stream) = ws.split();
                handle_tunnel(
                    Box::new(WsReader { stream }),
                    Box::new(WsWriter { sink }),
                    early,
                    gateway,
                )
                .await;
            }
            .instrument(info_span!("session", peer = %source)),
        );
        Ok(())
    }
}

/// Completes the upgrade and extracts the early message carried in
/// `Sec-WebSocket-Protocol`, echoing the header back to the client.
async fn upgrade(
    socket: TcpStream,
) -> Result<(WebSocketStream<TcpStream>, Option<Bytes>), Error> {
    let mut protocol: Option<HeaderValue> = None;
    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        if let Some(value) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            resp.headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, value.clone());
            protocol = Some(value.clone());
        }
        Ok(resp)
    };
    let ws = accept_hdr_async(socket, callback)
        .await
        .context("websocket handshake")?;
    let early = protocol
        .as_ref()
        .and_then(|v| v.to_str().ok())
        .and_then(decode_base64url);
    if early.is_some() {
        trace!("early data present");
    }
    Ok((ws, early))
}

/// Lenient base64url: padding is optional and `+`/`/` are accepted.
pub fn decode_base64url(s: &str) -> Option<Bytes> {
    let s: String = s
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    match URL_SAFE_NO_PAD.decode(s.as_bytes()) {
        Ok(data) if !data.is_empty() => Some(data.into()),
        _ => None,
    }
}

pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> MessageReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> IoResult<Option<Bytes>> {
        loop {
            let msg = match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return closed_or(e).map(|_| None),
                Some(Ok(msg)) => msg,
            };
            match msg {
                Message::Binary(data) => return Ok(Some(data)),
                Message::Text(text) => match decode_base64url(text.as_str()) {
                    Some(data) => return Ok(Some(data)),
                    None => debug!("dropping undecodable text frame"),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }
}

pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> MessageWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: Bytes) -> IoResult<()> {
        self.sink
            .send(Message::Binary(msg))
            .await
            .map_err(IoError::other)
    }

    async fn close(&mut self) -> IoResult<()> {
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(e) => closed_or(e),
        }
    }
}

fn closed_or(e: tungstenite::Error) -> IoResult<()> {
    use tungstenite::error::ProtocolError;
    match e {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => Ok(()),
        e => Err(IoError::other(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64url_variants() {
        // 0xfb 0xff encodes to "+/8" in standard alphabet
        assert_eq!(decode_base64url("-_8").unwrap(), Bytes::from_static(&[0xfb, 0xff]));
        assert_eq!(decode_base64url("+/8=").unwrap(), Bytes::from_static(&[0xfb, 0xff]));
        assert_eq!(decode_base64url("aGVsbG8").unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(decode_base64url("aGVsbG8=").unwrap(), Bytes::from_static(b"hello"));
        assert!(decode_base64url("").is_none());
        assert!(decode_base64url("not base64!").is_none());
    }
}
