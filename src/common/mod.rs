use tokio::io::{AsyncRead, AsyncWrite};

pub mod dialers;
pub mod dns;
pub mod doh;
pub mod frames;
pub mod header;
pub mod socks;

pub trait IOStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T> IOStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

#[cfg(not(windows))]
pub fn set_keepalive(stream: &tokio::net::TcpStream) -> std::io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt::KeepAlive};
    setsockopt(stream, KeepAlive, &true).map_err(std::io::Error::from)
}

#[cfg(windows)]
pub fn set_keepalive(_stream: &tokio::net::TcpStream) -> std::io::Result<()> {
    tracing::warn!("keepalive not supported on this platform");
    Ok(())
}
