//! # LXP (Lane eXchange Protocol)
//!
//! NAT 인지형 연결 수립 + 적응형 멀티레인 전송 엔진
//!
//! ## 핵심 특징
//! - **NAT 분류**: STUN 프로브 2개 이상으로 콘형/대칭형/차단 판별
//! - **전략 선택**: 로컬×원격 분류 조합 → 직결/릴레이 폴백/릴레이 전용
//! - **링크 수립**: 후보 수집 → 연결성 검사 경쟁 → 릴레이 폴백 캐스케이드
//! - **멀티레인**: 병렬 비신뢰 레인에 청크 분산, 워터마크 기반 백프레셔
//! - **적응형 프레이밍**: RTT/손실/링크 등급 기반 청크 크기 버킷 조정
//! - **전송 모니터링**: 품질 점수(0~100) + 병목 분류 + 권장 조치

pub mod candidate;
pub mod chunk;
pub mod config;
pub mod error;
pub mod framer;
pub mod lane;
pub mod link;
pub mod monitor;
pub mod nat;
pub mod signaling;
pub mod strategy;
pub mod stun;
pub mod wire;

pub use candidate::{Candidate, CandidateKind, CandidatePair};
pub use chunk::{Chunk, ChunkHeader, InsertOutcome, Reassembler};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use framer::{AdaptiveFramer, Aggressiveness, LinkClass};
pub use lane::{LaneManager, LaneRole, LaneState, LaneTransport, TransferEvent};
pub use link::{
    EstablishedLink, LinkEstablisher, LinkHandle, LinkSession, LinkState, RelayMode, TransportMode,
};
pub use monitor::{BenchmarkStats, Bottleneck, TransferMonitor};
pub use nat::{Classifier, Confidence, NatClass, NatClassification, NatProbeResult};
pub use signaling::{SignalingEvent, SignalingOutbound, SignalingPort};
pub use strategy::{select, ConnectionStrategy, StrategyMode};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (프레임 식별용)
pub const MAGIC_NUMBER: u32 = 0x4C585050; // "LXPP"

/// 레인 송신 버퍼 상한 워터마크 (바이트)
///
/// 이 값 이상 적체된 레인은 로테이션에서 한 바퀴 제외됨
pub const HIGH_WATERMARK: usize = 16 * 1024 * 1024; // 16MiB

/// 레인 송신 버퍼 하한 워터마크 (바이트)
///
/// 일시 제외된 레인은 이 값 아래로 배수되면 다시 후보가 됨
pub const LOW_WATERMARK: usize = 4 * 1024 * 1024; // 4MiB

/// 기본 레인 수
pub const DEFAULT_LANE_COUNT: usize = 3;

/// 최대 레인 수
pub const MAX_LANE_COUNT: usize = 4;
