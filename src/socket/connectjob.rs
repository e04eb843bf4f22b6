use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::socket::pool::Target;
use crate::socket::stream::BoxedSocket;
use tokio::net::TcpStream;

/// Manages the connection process: DNS -> TCP.
/// Roughly equivalent to net::ConnectJob.
pub struct ConnectJob;

impl ConnectJob {
    pub async fn connect(target: &Target) -> Result<BoxedSocket, NetError> {
        let addrs: Vec<_> = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .dns_context(&target.host)?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    // Requests are written in one piece; don't let Nagle hold the tail.
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(host = %target.host, %addr, "connected");
                    return Ok(BoxedSocket::new(stream));
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
        });
        Err::<BoxedSocket, _>(err).connection_context(&target.host, target.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_local() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let socket = ConnectJob::connect(&Target::new("127.0.0.1", port)).await.unwrap();
        assert!(socket.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = ConnectJob::connect(&Target::new("127.0.0.1", port)).await.unwrap_err();
        assert!(matches!(err, NetError::ConnectionFailedTo { port: p, .. } if p == port));
    }
}
