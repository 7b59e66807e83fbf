//! A registered EtherNet/IP session over TCP.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    cip, cpf,
    encap::{register_session_payload, HEADER_LEN},
    Command, Error, Header, Result,
};

/// A registered session with a single device.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    handle: u32,
    timeout: Duration,
}

impl Session {
    /// Connect to `addr` and register a session. `timeout` bounds the
    /// connect and every later request.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails, the device answers with
    /// another command, or the returned session handle is 0.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout {
                operation: "connect",
                after_ms: timeout.as_millis() as u64,
            })??;
        stream.set_nodelay(true)?;

        let mut session = Session {
            stream,
            peer: addr,
            handle: 0,
            timeout,
        };

        let (header, _) = session
            .transact(Command::RegisterSession, &register_session_payload(), "register session")
            .await?;
        if header.session_handle == 0 {
            return Err(Error::NoSession);
        }
        session.handle = header.session_handle;

        tracing::debug!(peer = %addr, session = session.handle, "enip session registered");

        Ok(session)
    }

    /// Session handle assigned by the device.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Read the data attribute of assembly `instance`, returning the raw
    /// process data without the CIP reply header.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a malformed reply, or a
    /// non-zero CIP general status.
    pub async fn read_assembly(&mut self, instance: u16) -> Result<Vec<u8>> {
        let request = cip::get_attribute_single(cip::CLASS_ASSEMBLY, instance, cip::ATTRIBUTE_DATA);
        let payload = cpf::encode_unconnected(&request);

        let (_, reply) = self.transact(Command::SendRRData, &payload, "read assembly").await?;
        let item = cpf::unconnected_data(&reply)?;
        Ok(cip::reply_data(item)?.to_vec())
    }

    /// Unregister the session and close the socket. Devices drop the
    /// connection rather than answer, so no reply is awaited.
    ///
    /// # Errors
    ///
    /// Returns an error if the unregister request could not be written.
    pub async fn close(mut self) -> Result<()> {
        let frame = Header::request(Command::UnregisterSession, self.handle, 0).encode_with(&[]);
        let written = tokio::time::timeout(self.timeout, self.stream.write_all(&frame)).await;
        let _ = self.stream.shutdown().await;

        tracing::debug!(peer = %self.peer, session = self.handle, "enip session closed");

        match written {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout {
                operation: "unregister session",
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    async fn transact(
        &mut self,
        command: Command,
        payload: &[u8],
        operation: &'static str,
    ) -> Result<(Header, Vec<u8>)> {
        let length = u16::try_from(payload.len())
            .map_err(|_| Error::Frame(format!("payload of {} bytes does not fit a frame", payload.len())))?;
        let frame = Header::request(command, self.handle, length).encode_with(payload);
        let timeout = self.timeout;

        tokio::time::timeout(timeout, self.exchange(command, &frame))
            .await
            .map_err(|_| Error::Timeout {
                operation,
                after_ms: timeout.as_millis() as u64,
            })?
    }

    async fn exchange(&mut self, command: Command, frame: &[u8]) -> Result<(Header, Vec<u8>)> {
        self.stream.write_all(frame).await?;

        let mut raw = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut raw).await?;
        let header = Header::decode(&raw)?;

        let mut payload = vec![0u8; usize::from(header.length)];
        self.stream.read_exact(&mut payload).await?;

        header.expect_reply_to(command)?;
        Ok((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    use super::*;

    const SESSION: u32 = 0x0001_0203;

    /// A device that registers a session, answers every assembly read with
    /// `data`, and hangs up on unregister.
    async fn fake_device(data: Vec<u8>, handle: u32) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            loop {
                let mut raw = [0u8; HEADER_LEN];
                if socket.read_exact(&mut raw).await.is_err() {
                    return;
                }
                let header = Header::decode(&raw).unwrap();
                let mut payload = vec![0u8; usize::from(header.length)];
                socket.read_exact(&mut payload).await.unwrap();

                let reply = match header.command {
                    0x0065 => Header {
                        session_handle: handle,
                        ..header
                    }
                    .encode_with(&payload),
                    0x006F => {
                        let mut cip_reply = vec![0x8E, 0, 0, 0];
                        cip_reply.extend_from_slice(&data);
                        let body = cpf::encode_unconnected(&cip_reply);
                        Header {
                            length: body.len() as u16,
                            ..header
                        }
                        .encode_with(&body)
                    }
                    _ => return,
                };
                socket.write_all(&reply).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_register_read_close() {
        let addr = fake_device(vec![0xAA, 0xBB, 0x01, 0xF4], SESSION).await;

        let mut session = Session::connect(addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.handle(), SESSION);
        assert_eq!(session.read_assembly(100).await.unwrap(), vec![0xAA, 0xBB, 0x01, 0xF4]);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_session_handle_is_rejected() {
        let addr = fake_device(vec![], 0).await;

        let err = Session::connect(addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::NoSession));
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Session::connect(addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
