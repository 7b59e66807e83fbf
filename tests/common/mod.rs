//! Fake field devices on local ports.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use robo_scanner::{
    frame::{Frame, FrameSource},
    targets::{ActuationTarget, CoilAddress, CoilTarget},
};
use test_context::AsyncTestContext;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::Instant,
};

/// A coil write as seen by the relay board.
#[derive(Debug, Clone, Copy)]
pub struct CoilWrite {
    pub address: u16,
    pub value: bool,
    pub at: Instant,
}

#[derive(Default)]
struct BoardState {
    coils: HashMap<u16, bool>,
    writes: Vec<CoilWrite>,
}

/// A Modbus/TCP relay board that records every coil write and answers coil
/// reads from its current state.
pub struct FakeRelayBoard {
    pub port: u16,
    state: Arc<Mutex<BoardState>>,
    handle: JoinHandle<()>,
}

impl FakeRelayBoard {
    pub async fn start() -> Result<Self> {
        let port = portpicker::pick_unused_port().ok_or_else(|| anyhow::anyhow!("no port available"))?;
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let state = Arc::new(Mutex::new(BoardState::default()));

        let shared = state.clone();
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_modbus(socket, shared.clone()));
            }
        });

        Ok(Self { port, state, handle })
    }

    /// Every write so far, oldest first, by 0-based wire address.
    pub fn writes(&self) -> Vec<CoilWrite> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Drive the coil at 0-based `address` as an external input would.
    pub fn set_input(&self, address: u16, value: bool) {
        self.state.lock().unwrap().coils.insert(address, value);
    }

    /// A target on this board driving the 1-based `coil`.
    pub fn target(&self, id: u32, coil: u16, pulse_seconds: Option<u32>) -> ActuationTarget {
        ActuationTarget {
            id,
            name: format!("Bin {id}"),
            host: "127.0.0.1".to_string(),
            port: self.port,
            unit_id: 1,
            timeout_ms: 500,
            coil: Some(CoilAddress::new(coil).unwrap()),
            pulse_seconds,
        }
    }

    /// The resolved 1-based `coil` on this board.
    pub fn coil_target(&self, coil: u16) -> CoilTarget {
        self.target(0, coil, None).coil_target().unwrap()
    }
}

async fn serve_modbus(mut socket: TcpStream, state: Arc<Mutex<BoardState>>) {
    loop {
        let mut header = [0u8; 7];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let len = usize::from(u16::from_be_bytes([header[4], header[5]])).saturating_sub(1);
        let mut pdu = vec![0u8; len];
        if socket.read_exact(&mut pdu).await.is_err() {
            return;
        }

        let answer = match pdu.as_slice() {
            [0x05, hi, lo, on, _] => {
                let address = u16::from_be_bytes([*hi, *lo]);
                let value = *on == 0xFF;
                let mut state = state.lock().unwrap();
                state.coils.insert(address, value);
                state.writes.push(CoilWrite {
                    address,
                    value,
                    at: Instant::now(),
                });
                pdu.clone()
            }
            [0x01, hi, lo, qhi, qlo] => {
                let start = u16::from_be_bytes([*hi, *lo]);
                let quantity = u16::from_be_bytes([*qhi, *qlo]);
                let state = state.lock().unwrap();
                let mut bits = vec![0u8; usize::from(quantity).div_ceil(8)];
                for i in 0..quantity {
                    if state.coils.get(&(start + i)).copied().unwrap_or(false) {
                        bits[usize::from(i / 8)] |= 1 << (i % 8);
                    }
                }
                let mut answer = vec![0x01, bits.len() as u8];
                answer.extend_from_slice(&bits);
                answer
            }
            [function, ..] => vec![function | 0x80, 0x01],
            [] => return,
        };

        let mut frame = header[..4].to_vec();
        frame.extend_from_slice(&((answer.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend_from_slice(&answer);
        if socket.write_all(&frame).await.is_err() {
            return;
        }
    }
}

/// How the fake gateway answers assembly reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayFault {
    /// Reply with this non-zero CIP general status.
    CipStatus(u8),
    /// Never reply.
    Silent,
}

#[derive(Default)]
struct GatewayState {
    assembly: Vec<u8>,
    fault: Option<GatewayFault>,
    unregistered: usize,
}

/// An EtherNet/IP gateway serving one assembly whose bytes the test controls.
pub struct FakeSensorGateway {
    pub port: u16,
    state: Arc<Mutex<GatewayState>>,
    handle: JoinHandle<()>,
}

impl FakeSensorGateway {
    pub async fn start(assembly: Vec<u8>) -> Result<Self> {
        let port = portpicker::pick_unused_port().ok_or_else(|| anyhow::anyhow!("no port available"))?;
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let state = Arc::new(Mutex::new(GatewayState {
            assembly,
            ..Default::default()
        }));

        let shared = state.clone();
        let handle = tokio::spawn(async move {
            let mut next_handle = 0x1000_0000u32;
            while let Ok((socket, _)) = listener.accept().await {
                next_handle += 1;
                tokio::spawn(serve_enip(socket, next_handle, shared.clone()));
            }
        });

        Ok(Self { port, state, handle })
    }

    pub fn set_assembly(&self, assembly: Vec<u8>) {
        self.state.lock().unwrap().assembly = assembly;
    }

    /// Fail assembly reads until cleared with `None`.
    pub fn set_fault(&self, fault: Option<GatewayFault>) {
        self.state.lock().unwrap().fault = fault;
    }

    /// Sessions unregistered so far.
    pub fn unregistered(&self) -> usize {
        self.state.lock().unwrap().unregistered
    }
}

async fn serve_enip(mut socket: TcpStream, session: u32, state: Arc<Mutex<GatewayState>>) {
    loop {
        let mut raw = [0u8; enip::encap::HEADER_LEN];
        if socket.read_exact(&mut raw).await.is_err() {
            return;
        }
        let Ok(header) = enip::Header::decode(&raw) else {
            return;
        };
        let mut payload = vec![0u8; usize::from(header.length)];
        if socket.read_exact(&mut payload).await.is_err() {
            return;
        }

        let reply = match header.command {
            0x0065 => enip::Header {
                session_handle: session,
                ..header
            }
            .encode_with(&payload),
            0x0066 => {
                state.lock().unwrap().unregistered += 1;
                return;
            }
            0x006F => {
                let cip = {
                    let state = state.lock().unwrap();
                    match state.fault {
                        Some(GatewayFault::Silent) => None,
                        Some(GatewayFault::CipStatus(status)) => Some(vec![0x8E, 0, status, 0]),
                        None => {
                            let mut cip = vec![0x8E, 0, 0, 0];
                            cip.extend_from_slice(&state.assembly);
                            Some(cip)
                        }
                    }
                };
                let Some(cip) = cip else {
                    continue;
                };
                let body = enip::cpf::encode_unconnected(&cip);
                enip::Header {
                    length: body.len() as u16,
                    ..header
                }
                .encode_with(&body)
            }
            _ => return,
        };
        if socket.write_all(&reply).await.is_err() {
            return;
        }
    }
}

/// An assembly with a big-endian distance at each `(offset, mm)`.
pub fn assembly(len: usize, distances: &[(usize, u16)]) -> Vec<u8> {
    let mut raw = vec![0u8; len];
    for &(offset, mm) in distances {
        raw[offset..offset + 2].copy_from_slice(&mm.to_be_bytes());
    }
    raw
}

/// A camera that always sees the same frame.
pub struct StaticCamera(pub Frame);

#[async_trait]
impl FrameSource for StaticCamera {
    fn name(&self) -> &str {
        "static"
    }

    async fn capture(&self) -> Result<Frame> {
        Ok(self.0.clone())
    }
}

/// A dark `size`x`size` square on a light 200x150 gray frame.
pub fn square_frame(size: usize) -> Frame {
    let (w, h) = (200, 150);
    let mut data = vec![230u8; w * h];
    for row in 30..30 + size {
        data[row * w + 40..row * w + 40 + size].fill(20);
    }
    Frame::gray(w, h, data).unwrap()
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub struct RelayContext {
    pub board: FakeRelayBoard,
}

impl AsyncTestContext for RelayContext {
    async fn setup() -> Self {
        RelayContext {
            board: FakeRelayBoard::start().await.unwrap(),
        }
    }

    async fn teardown(self) {
        self.board.handle.abort();
    }
}

pub struct SensorContext {
    pub board: FakeRelayBoard,
    pub gateway: FakeSensorGateway,
}

impl AsyncTestContext for SensorContext {
    async fn setup() -> Self {
        SensorContext {
            board: FakeRelayBoard::start().await.unwrap(),
            gateway: FakeSensorGateway::start(assembly(128, &[(118, 250), (120, 400)]))
                .await
                .unwrap(),
        }
    }

    async fn teardown(self) {
        self.board.handle.abort();
        self.gateway.handle.abort();
    }
}
