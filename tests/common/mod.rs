#![allow(dead_code)]

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use wsflow::{Options, WebSocketChannel};

pub const FIN: u8 = 0x80;
pub const RSV1: u8 = 0x40;

pub const TEXT: u8 = 0x1;
pub const BINARY: u8 = 0x2;
pub const CONTINUATION: u8 = 0x0;
pub const CLOSE: u8 = 0x8;
pub const PING: u8 = 0x9;
pub const PONG: u8 = 0xA;

/// A frame as seen on the wire by the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub fin: bool,
    pub rsv: u8,
    pub opcode: u8,
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// The remote end of a channel, speaking raw frames.
pub struct RawPeer {
    pub io: DuplexStream,
    pub mask: Option<[u8; 4]>,
}

pub fn pair(options: Options) -> (WebSocketChannel, RawPeer) {
    let (io, peer) = tokio::io::duplex(64 * 1024);
    (WebSocketChannel::new(io, options), RawPeer::new(peer, true))
}

/// Encodes a frame with the given first header byte.
pub fn encode(first: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = vec![first];
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        len if len < 126 => out.push(mask_bit | len as u8),
        len if len <= u16::MAX as usize => {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

impl RawPeer {
    /// `masked` peers play the client side.
    pub fn new(io: DuplexStream, masked: bool) -> Self {
        Self {
            io,
            mask: masked.then_some([0x37, 0xfa, 0x21, 0x3d]),
        }
    }

    pub async fn send(&mut self, first: u8, payload: &[u8]) {
        let bytes = encode(first, payload, self.mask);
        self.io.write_all(&bytes).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    pub async fn read_frame(&mut self) -> RawFrame {
        let mut head = [0u8; 2];
        self.io.read_exact(&mut head).await.unwrap();

        let masked = head[1] & 0x80 != 0;
        let len = match head[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                self.io.read_exact(&mut ext).await.unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.io.read_exact(&mut ext).await.unwrap();
                u64::from_be_bytes(ext) as usize
            }
            len => len as usize,
        };

        let mut key = [0u8; 4];
        if masked {
            self.io.read_exact(&mut key).await.unwrap();
        }
        let mut payload = vec![0u8; len];
        self.io.read_exact(&mut payload).await.unwrap();
        if masked {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        RawFrame {
            fin: head[0] & FIN != 0,
            rsv: (head[0] & 0x70) >> 4,
            opcode: head[0] & 0x0F,
            masked,
            payload,
        }
    }

    /// Reads until the channel drops its end.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        self.io.read_to_end(&mut rest).await.unwrap();
        rest
    }
}

pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    payload
}
