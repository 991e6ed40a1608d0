//! 프로토콜 프레임 정의
//!
//! 모든 레인 트래픽은 단일 프레임 형식을 공유한다:
//! `u16 헤더 길이 (LE) + bincode(FrameHeader) + 본문`
//!
//! 청크 본문은 [`Chunk::to_bytes`] 형식을 그대로 싣고, 제어 프레임 본문은
//! 메시지 구조체의 bincode다.

use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 프레임 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// 데이터 청크
    Chunk = 1,

    /// 단일 인덱스 재요청 (무결성 실패 시)
    Rerequest = 2,

    /// 전송 완료 알림 (수신측 → 송신측)
    TransferComplete = 3,

    /// 레인 RTT 프로브
    Probe = 4,

    /// 프로브 응답
    Echo = 5,
}

/// 프레임 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 프레임 타입
    pub frame_type: FrameType,

    /// 송신 레인 ID
    pub lane_id: u8,

    /// 본문 길이 (헤더 제외)
    pub body_len: u32,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, lane_id: u8, body_len: u32) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            frame_type,
            lane_id,
            body_len,
        }
    }
}

/// 단일 인덱스 재요청 메시지
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RerequestMessage {
    pub transfer_id: u64,
    pub sequence_index: u64,
}

/// 전송 완료 메시지
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransferCompleteMessage {
    pub transfer_id: u64,
    pub total_count: u64,
    pub elapsed_ms: u64,
}

/// RTT 프로브/응답 메시지
///
/// Echo는 Probe의 token/timestamp를 그대로 되돌린다
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProbeMessage {
    pub token: u64,
    pub timestamp_us: u64,
}

impl ProbeMessage {
    pub fn new(token: u64) -> Self {
        let timestamp_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self {
            token,
            timestamp_us,
        }
    }
}

/// 통합 프레임 enum
#[derive(Debug, Clone)]
pub enum Frame {
    Chunk(Chunk),
    Rerequest(RerequestMessage),
    TransferComplete(TransferCompleteMessage),
    Probe(ProbeMessage),
    Echo(ProbeMessage),
}

impl Frame {
    /// 프레임 타입 반환
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Chunk(_) => FrameType::Chunk,
            Frame::Rerequest(_) => FrameType::Rerequest,
            Frame::TransferComplete(_) => FrameType::TransferComplete,
            Frame::Probe(_) => FrameType::Probe,
            Frame::Echo(_) => FrameType::Echo,
        }
    }

    /// 프레임 직렬화
    pub fn encode(&self, lane_id: u8) -> Vec<u8> {
        let body = match self {
            Frame::Chunk(chunk) => chunk.to_bytes(),
            Frame::Rerequest(msg) => bincode::serialize(msg).unwrap_or_default(),
            Frame::TransferComplete(msg) => bincode::serialize(msg).unwrap_or_default(),
            Frame::Probe(msg) | Frame::Echo(msg) => bincode::serialize(msg).unwrap_or_default(),
        };

        let header = FrameHeader::new(self.frame_type(), lane_id, body.len() as u32);
        let header_bytes = bincode::serialize(&header).unwrap_or_default();

        let mut buf = Vec::with_capacity(2 + header_bytes.len() + body.len());
        buf.extend_from_slice(&(header_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&body);
        buf
    }

    /// 프레임 역직렬화 → (레인 ID, 프레임)
    pub fn decode(bytes: &[u8]) -> Result<(u8, Frame)> {
        if bytes.len() < 2 {
            return Err(Error::Serialization(Box::new(
                bincode::ErrorKind::SizeLimit,
            )));
        }

        let header_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + header_len {
            return Err(Error::Serialization(Box::new(
                bincode::ErrorKind::SizeLimit,
            )));
        }

        let header: FrameHeader = bincode::deserialize(&bytes[2..2 + header_len])?;

        if header.magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: header.magic,
            });
        }
        if header.version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: header.version,
            });
        }

        let body = &bytes[2 + header_len..];
        let frame = match header.frame_type {
            FrameType::Chunk => {
                let chunk = Chunk::from_bytes(body).ok_or_else(|| {
                    Error::Serialization(Box::new(bincode::ErrorKind::SizeLimit))
                })?;
                Frame::Chunk(chunk)
            }
            FrameType::Rerequest => Frame::Rerequest(bincode::deserialize(body)?),
            FrameType::TransferComplete => Frame::TransferComplete(bincode::deserialize(body)?),
            FrameType::Probe => Frame::Probe(bincode::deserialize(body)?),
            FrameType::Echo => Frame::Echo(bincode::deserialize(body)?),
        };

        Ok((header.lane_id, frame))
    }
}
