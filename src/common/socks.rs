use std::io::{Error as IoError, ErrorKind};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub const SOCKS_VER_5: u8 = 5u8;
pub const SOCKS_CMD_CONNECT: u8 = 1u8;
pub const SOCKS_ATYP_INET4: u8 = 1u8;
pub const SOCKS_ATYP_DOMAIN: u8 = 3u8;
pub const SOCKS_ATYP_INET6: u8 = 4u8;
pub const SOCKS_AUTH_NONE: u8 = 0u8;
pub const SOCKS_AUTH_USRPWD: u8 = 2u8;
pub const SOCKS_AUTH_USRPWD_VER: u8 = 1u8;
pub const SOCKS_REPLY_OK: u8 = 0u8;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("bad socks5 greeting")]
    BadGreeting,
    #[error("socks5 authentication failed")]
    AuthFailed,
    #[error("unsupported socks5 auth method: {0}")]
    UnsupportedAuthMethod(u8),
    #[error("socks5 connect rejected: reply {0}")]
    ConnectRejected(u8),
    #[error("socks5 transport error: {0}")]
    Transport(#[from] IoError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Runs the client side of a SOCKS5 CONNECT over an already open stream.
///
/// The destination is always sent in domain-name form, literal IPs included.
/// On success the stream carries raw payload only.
pub async fn handshake<IO>(
    socket: &mut IO,
    auth: Option<&Credentials>,
    host: &str,
    port: u16,
) -> Result<(), ConnectError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    // pre auth negotiation
    let methods: &[u8] = if auth.is_some() {
        &[SOCKS_AUTH_NONE, SOCKS_AUTH_USRPWD]
    } else {
        &[SOCKS_AUTH_NONE]
    };
    let mut greeting = vec![SOCKS_VER_5, methods.len() as u8];
    greeting.extend_from_slice(methods);
    socket.write_all(&greeting).await?;
    socket.flush().await?;

    let mut reply = [0u8; 2];
    socket.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VER_5 {
        return Err(ConnectError::BadGreeting);
    }
    let peer_method = reply[1];
    trace!("peer_method: {}", peer_method);

    // authentication
    match (peer_method, auth) {
        (SOCKS_AUTH_NONE, _) => {}
        (SOCKS_AUTH_USRPWD, Some(auth)) => write_password_auth(socket, auth).await?,
        // not offered in the greeting
        (SOCKS_AUTH_USRPWD, None) => return Err(ConnectError::BadGreeting),
        (x, _) => return Err(ConnectError::UnsupportedAuthMethod(x)),
    }

    // request
    let domain = host.as_bytes();
    let domain_len = u8::try_from(domain.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidInput, "destination host too long"))?;
    let mut request = vec![SOCKS_VER_5, SOCKS_CMD_CONNECT, 0, SOCKS_ATYP_DOMAIN, domain_len];
    request.extend_from_slice(domain);
    request.extend_from_slice(&port.to_be_bytes());
    socket.write_all(&request).await?;
    socket.flush().await?;

    read_connect_reply(socket).await
}

async fn write_password_auth<IO>(socket: &mut IO, auth: &Credentials) -> Result<(), ConnectError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let user = auth.username.as_bytes();
    let pass = auth.password.as_bytes();
    let user_len = u8::try_from(user.len()).map_err(|_| ConnectError::AuthFailed)?;
    let pass_len = u8::try_from(pass.len()).map_err(|_| ConnectError::AuthFailed)?;
    let mut buf = Vec::with_capacity(3 + user.len() + pass.len());
    buf.push(SOCKS_AUTH_USRPWD_VER);
    buf.push(user_len);
    buf.extend_from_slice(user);
    buf.push(pass_len);
    buf.extend_from_slice(pass);
    socket.write_all(&buf).await?;
    socket.flush().await?;

    let mut result = [0u8; 2];
    socket.read_exact(&mut result).await?;
    if result[1] != SOCKS_REPLY_OK {
        return Err(ConnectError::AuthFailed);
    }
    Ok(())
}

async fn read_connect_reply<IO>(socket: &mut IO) -> Result<(), ConnectError>
where
    IO: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    socket.read_exact(&mut head[..2]).await?;
    if head[1] != SOCKS_REPLY_OK {
        return Err(ConnectError::ConnectRejected(head[1]));
    }
    socket.read_exact(&mut head[2..]).await?;
    // drain the bound address so it never reaches the relay
    let addr_len = match head[3] {
        SOCKS_ATYP_INET4 => 4,
        SOCKS_ATYP_INET6 => 16,
        SOCKS_ATYP_DOMAIN => socket.read_u8().await? as usize,
        x => {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("not supported addr type: {}", x),
            )
            .into());
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    socket.read_exact(&mut bound).await?;
    trace!("socks5 bound address: {:?}", bound);
    Ok(())
}
