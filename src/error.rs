//! 에러 타입 정의

use thiserror::Error;

/// LXP 엔진 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("유효하지 않은 STUN 응답: {reason}")]
    InvalidStunResponse { reason: &'static str },

    #[error("프로브 응답 부족: responded={responded}, required={required}")]
    InsufficientProbes { responded: usize, required: usize },

    #[error("직결 경로 없음")]
    NoDirectPath,

    #[error("릴레이 서버 도달 불가")]
    RelayUnreachable,

    #[error("시그널링 타임아웃")]
    SignalingTimeout,

    #[error("재시도 횟수 초과: attempts={attempts}")]
    RetriesExhausted { attempts: u32 },

    #[error("링크 미연결 상태: {state}")]
    LinkNotConnected { state: &'static str },

    #[error("레인 닫힘: lane_id={lane_id}")]
    LaneClosed { lane_id: u8 },

    #[error("활성 레인 없음")]
    AllLanesClosed,

    #[error("청크 무결성 불일치: transfer_id={transfer_id}, sequence_index={sequence_index}")]
    IntegrityMismatch {
        transfer_id: u64,
        sequence_index: u64,
    },

    #[error("채널 닫힘")]
    ChannelClosed,

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
