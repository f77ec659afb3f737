//! Socket construction through socket2

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{SocketAddr, TcpListener, UdpSocket};

use crate::error::NetworkError;

/// Send buffer sized for a few frames of bursty video
const SEND_BUFFER_SIZE: usize = 1024 * 1024;

/// Create a UDP socket for sending media
pub fn create_socket(bind: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_SIZE) {
        tracing::debug!("Could not enlarge UDP send buffer: {}", e);
    }

    socket
        .bind(&SockAddr::from(bind))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", bind, e)))?;

    Ok(socket.into())
}

/// Create the presence listener of the streaming server
///
/// The listener is non-blocking so the accept loop can poll its stop flag.
pub fn create_listener(bind: SocketAddr, backlog: i32) -> Result<TcpListener, NetworkError> {
    let socket = Socket::new(Domain::for_address(bind), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&SockAddr::from(bind))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", bind, e)))?;
    socket
        .listen(backlog)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_loopback() {
        let sender = create_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let receiver = create_socket("127.0.0.1:0".parse().unwrap()).unwrap();

        sender.send_to(b"ping", receiver.local_addr().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_listener_is_nonblocking() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
