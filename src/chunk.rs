//! 청크 정의와 레인 무관 재조립
//!
//! - Chunk: 전송 단위. 페이로드는 외부 암호화 협력자가 이미 암호화한
//!   불투명 바이트이며 무결성 다이제스트와 시퀀스 인덱스가 붙는다
//! - 시퀀스 인덱스는 전송 단위로 전역 유일, 생성 시점에 단조 할당, 재사용 없음
//! - 재조립은 도착 레인/순서와 무관하게 시퀀스 인덱스 기준

use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 청크 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// 전송 ID
    pub transfer_id: u64,

    /// 전송 내 시퀀스 인덱스
    pub sequence_index: u64,

    /// 전송 내 총 청크 수
    pub total_count: u64,

    /// 페이로드 길이 (바이트)
    pub data_len: u32,

    /// CRC32 무결성 다이제스트
    pub digest: u32,

    /// 생성 타임스탬프 (마이크로초)
    pub timestamp_us: u64,
}

/// 청크 (레인 송신 단위)
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 청크 헤더
    pub header: ChunkHeader,

    /// 암호화된 불투명 페이로드
    pub payload: Bytes,
}

impl Chunk {
    /// 새 청크 생성 (다이제스트 계산 포함)
    pub fn new(transfer_id: u64, sequence_index: u64, total_count: u64, payload: Bytes) -> Self {
        let digest = crc32fast::hash(&payload);
        let timestamp_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;

        Self {
            header: ChunkHeader {
                transfer_id,
                sequence_index,
                total_count,
                data_len: payload.len() as u32,
                digest,
                timestamp_us,
            },
            payload,
        }
    }

    /// 청크를 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        let header_bytes = bincode::serialize(&self.header).unwrap_or_default();
        let header_len = header_bytes.len() as u16;

        let mut buf = Vec::with_capacity(2 + header_bytes.len() + self.payload.len());
        buf.extend_from_slice(&header_len.to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// 바이트에서 청크 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }

        let header_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + header_len {
            return None;
        }

        let header: ChunkHeader = bincode::deserialize(&bytes[2..2 + header_len]).ok()?;
        let payload = Bytes::copy_from_slice(&bytes[2 + header_len..]);

        Some(Self { header, payload })
    }

    /// 다이제스트 검증
    pub fn verify_digest(&self) -> bool {
        crc32fast::hash(&self.payload) == self.header.digest
    }
}

/// 청크 삽입 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 새로 삽입됨
    Inserted,

    /// 이미 유효 사본 보유
    Duplicate,

    /// 다이제스트 불일치 (해당 인덱스만 재요청 대상)
    DigestMismatch,

    /// 시퀀스 인덱스가 [0, total_count) 밖
    OutOfRange,
}

/// 전송 재조립기 (수신측)
///
/// 어느 레인으로 도착했는지와 무관하게 시퀀스 인덱스로 버퍼링하고,
/// [0, total_count)의 모든 인덱스가 유효 다이제스트로 관측되면 완료
#[derive(Debug)]
pub struct Reassembler {
    /// 전송 ID
    pub transfer_id: u64,

    /// 총 청크 수
    pub total_count: u64,

    /// 인덱스별 수신 페이로드
    slots: Vec<Option<Bytes>>,

    /// 수신 완료 인덱스 수
    received_count: u64,

    /// 생성 시간
    pub created_at: Instant,
}

impl Reassembler {
    /// 새 재조립기 생성
    pub fn new(transfer_id: u64, total_count: u64) -> Self {
        Self {
            transfer_id,
            total_count,
            slots: vec![None; total_count as usize],
            received_count: 0,
            created_at: Instant::now(),
        }
    }

    /// 청크 삽입
    pub fn insert(&mut self, chunk: &Chunk) -> InsertOutcome {
        let index = chunk.header.sequence_index;
        if index >= self.total_count {
            return InsertOutcome::OutOfRange;
        }

        if self.slots[index as usize].is_some() {
            return InsertOutcome::Duplicate;
        }

        if !chunk.verify_digest() {
            return InsertOutcome::DigestMismatch;
        }

        self.slots[index as usize] = Some(chunk.payload.clone());
        self.received_count += 1;
        InsertOutcome::Inserted
    }

    /// 완료 여부
    pub fn is_complete(&self) -> bool {
        self.received_count >= self.total_count
    }

    /// 누락 인덱스 목록
    pub fn missing_indices(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u64)
            .collect()
    }

    /// 수신률
    pub fn receive_ratio(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.received_count as f64 / self.total_count as f64
    }

    /// 완료된 바이트 스트림 추출 (시퀀스 인덱스 순 연결)
    ///
    /// 미완료 상태면 None
    pub fn into_data(self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }

        let total: usize = self
            .slots
            .iter()
            .map(|s| s.as_ref().map(|b| b.len()).unwrap_or(0))
            .sum();
        let mut out = Vec::with_capacity(total);
        for slot in self.slots {
            // is_complete 확인 후이므로 모든 슬롯이 채워져 있음
            if let Some(payload) = slot {
                out.extend_from_slice(&payload);
            }
        }
        Some(Bytes::from(out))
    }
}

/// 데이터를 시퀀스 청크들로 분할 (송신측 헬퍼)
pub fn split_into_chunks(transfer_id: u64, data: &[u8], chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let total_count = data.len().div_ceil(chunk_size).max(1) as u64;

    if data.is_empty() {
        return vec![Chunk::new(transfer_id, 0, 1, Bytes::new())];
    }

    data.chunks(chunk_size)
        .enumerate()
        .map(|(idx, part)| {
            Chunk::new(
                transfer_id,
                idx as u64,
                total_count,
                Bytes::copy_from_slice(part),
            )
        })
        .collect()
}
