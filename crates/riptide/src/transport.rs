use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any bidirectional byte stream a peer connection can ride on. Production
/// code uses TCP; tests substitute `tokio::io::duplex` pipes.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type Transport = Box<dyn TransportStream>;

pub fn from_tcp(stream: TcpStream) -> Transport {
    Box::new(stream)
}
