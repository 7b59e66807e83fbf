//! The Modbus/TCP client.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    frame::{unpack_coils, Header, MAX_READ_COILS, MBAP_HEADER_LEN},
    Error, Request, Response, Result,
};

/// A connected Modbus/TCP client talking to a single unit.
///
/// Requests are strictly sequential: one request is written and its answer
/// read back before the next goes out.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    unit_id: u8,
    transaction_id: u16,
    timeout: Duration,
}

impl Client {
    /// Connect to `addr`, giving up after `timeout`. The same timeout then
    /// bounds every request made through this client.
    ///
    /// # Errors
    ///
    /// Returns [Error::Timeout] if the connection is not established in time,
    /// or [Error::Io] if it is refused.
    pub async fn connect(addr: SocketAddr, unit_id: u8, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout {
                operation: "connect",
                after_ms: timeout.as_millis() as u64,
            })??;
        stream.set_nodelay(true)?;

        tracing::trace!(peer = %addr, unit_id, "modbus connected");

        Ok(Self {
            stream,
            peer: addr,
            unit_id,
            transaction_id: 0,
            timeout,
        })
    }

    /// Change the per-request timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Read `quantity` coils starting at the 0-based `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is out of range, the transport fails,
    /// or the device answers with an exception.
    pub async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>> {
        if quantity == 0 || quantity > MAX_READ_COILS {
            return Err(Error::InvalidRequest(format!("cannot read {} coils", quantity)));
        }

        match self.call(Request::ReadCoils { address, quantity }).await? {
            Response::ReadCoils(status) => {
                if status.len() * 8 < usize::from(quantity) {
                    return Err(Error::Frame(format!(
                        "asked for {} coils, got {} status bytes",
                        quantity,
                        status.len()
                    )));
                }
                Ok(unpack_coils(&status, quantity))
            }
            other => Err(Error::Frame(format!("unexpected response to read coils: {:?}", other))),
        }
    }

    /// Read a single coil at the 0-based `address`.
    ///
    /// # Errors
    ///
    /// See [Client::read_coils].
    pub async fn read_coil(&mut self, address: u16) -> Result<bool> {
        Ok(self.read_coils(address, 1).await?.first().copied().unwrap_or_default())
    }

    /// Force the coil at the 0-based `address` on or off.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails, the device answers with an
    /// exception, or the echoed write does not match the request.
    pub async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()> {
        match self.call(Request::WriteSingleCoil { address, value }).await? {
            Response::WriteSingleCoil {
                address: echoed_address,
                value: echoed_value,
            } if echoed_address == address && echoed_value == value => Ok(()),
            other => Err(Error::Frame(format!("unexpected response to coil write: {:?}", other))),
        }
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let transaction_id = self.transaction_id;
        let frame = request.encode(transaction_id, self.unit_id);
        let timeout = self.timeout;

        tracing::trace!(peer = %self.peer, transaction_id, ?request, "modbus request");

        tokio::time::timeout(timeout, self.exchange(transaction_id, &frame))
            .await
            .map_err(|_| Error::Timeout {
                operation: match request {
                    Request::ReadCoils { .. } => "read coils",
                    Request::WriteSingleCoil { .. } => "write single coil",
                },
                after_ms: timeout.as_millis() as u64,
            })?
    }

    async fn exchange(&mut self, transaction_id: u16, frame: &[u8]) -> Result<Response> {
        self.stream.write_all(frame).await?;

        let mut header = [0u8; MBAP_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let header = Header::decode(&header)?;

        let mut pdu = vec![0u8; header.pdu_len()];
        self.stream.read_exact(&mut pdu).await?;

        if header.transaction_id != transaction_id {
            return Err(Error::TransactionMismatch {
                sent: transaction_id,
                received: header.transaction_id,
            });
        }

        Response::decode(&pdu)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    use super::*;

    /// Answer exactly one request on the first accepted connection with the
    /// PDU produced by `reply`.
    async fn one_shot_device<F>(reply: F) -> SocketAddr
    where
        F: FnOnce(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; MBAP_HEADER_LEN];
            socket.read_exact(&mut header).await.unwrap();
            let len = usize::from(u16::from_be_bytes([header[4], header[5]])) - 1;
            let mut pdu = vec![0u8; len];
            socket.read_exact(&mut pdu).await.unwrap();

            let Some(answer) = reply(&pdu) else {
                // Hold the socket open without answering.
                tokio::time::sleep(Duration::from_secs(5)).await;
                return;
            };
            let mut frame = header[..4].to_vec();
            frame.extend_from_slice(&((answer.len() + 1) as u16).to_be_bytes());
            frame.push(header[6]);
            frame.extend_from_slice(&answer);
            socket.write_all(&frame).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_write_single_coil_echo() {
        let addr = one_shot_device(|pdu| {
            assert_eq!(pdu, &[0x05, 0, 2, 0xFF, 0x00]);
            Some(pdu.to_vec())
        })
        .await;

        let mut client = Client::connect(addr, 1, Duration::from_secs(1)).await.unwrap();
        client.write_single_coil(2, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_coil() {
        let addr = one_shot_device(|pdu| {
            assert_eq!(pdu, &[0x01, 0, 16, 0, 1]);
            Some(vec![0x01, 1, 0x01])
        })
        .await;

        let mut client = Client::connect(addr, 1, Duration::from_secs(1)).await.unwrap();
        assert!(client.read_coil(16).await.unwrap());
    }

    #[tokio::test]
    async fn test_exception_surfaces() {
        let addr = one_shot_device(|_| Some(vec![0x85, 0x02])).await;

        let mut client = Client::connect(addr, 1, Duration::from_secs(1)).await.unwrap();
        let err = client.write_single_coil(99, true).await.unwrap_err();
        assert!(matches!(err, Error::Exception { function: 0x05, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let addr = one_shot_device(|_| None).await;

        let mut client = Client::connect(addr, 1, Duration::from_millis(100)).await.unwrap();
        let err = client.write_single_coil(0, false).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_read_zero_coils_is_rejected() {
        let addr = one_shot_device(|_| None).await;

        let mut client = Client::connect(addr, 1, Duration::from_millis(100)).await.unwrap();
        assert!(matches!(
            client.read_coils(0, 0).await.unwrap_err(),
            Error::InvalidRequest(_)
        ));
    }
}
