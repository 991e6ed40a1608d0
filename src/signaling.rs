//! 시그널링 협력자 인터페이스
//!
//! 엔진은 시그널링 전송 방식을 정의하지 않는다. 호출자가 채널 반대편을
//! 자신의 시그널링 전송에 연결한다. 콜백 팬아웃 대신 이벤트 종류별
//! 유한 채널로 소유권과 백프레셔를 명시한다.
//!
//! 협상 메시지 바이트는 불투명하게 취급하며 해석하지 않는다.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::candidate::Candidate;
use crate::{Error, Result};

/// 기본 채널 용량
pub const DEFAULT_SIGNALING_CAPACITY: usize = 64;

/// 수신 이벤트 (상대 → 엔진)
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// 상대 후보 도착
    Candidate(Candidate),

    /// 상대 후보 수집 종료 표지
    EndOfCandidates,

    /// 불투명 협상 메시지 도착
    Negotiation(Bytes),
}

/// 송신 이벤트 (엔진 → 상대)
#[derive(Debug, Clone)]
pub enum SignalingOutbound {
    /// 로컬 후보 전달
    Candidate(Candidate),

    /// 로컬 후보 수집 종료 표지
    EndOfCandidates,

    /// 불투명 협상 메시지 전달
    Negotiation(Bytes),
}

/// 엔진 측 시그널링 포트
pub struct SignalingPort {
    /// 엔진 → 호출자 시그널링 전송
    outbound: mpsc::Sender<SignalingOutbound>,

    /// 호출자 시그널링 전송 → 엔진
    pub inbound: mpsc::Receiver<SignalingEvent>,
}

/// 호출자 측 반대편
pub struct SignalingRemote {
    /// 엔진이 내보낸 이벤트 수신
    pub outbound: mpsc::Receiver<SignalingOutbound>,

    /// 엔진으로 이벤트 주입
    pub inbound: mpsc::Sender<SignalingEvent>,
}

/// 포트 쌍 생성
pub fn channel(capacity: usize) -> (SignalingPort, SignalingRemote) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);

    (
        SignalingPort {
            outbound: out_tx,
            inbound: in_rx,
        },
        SignalingRemote {
            outbound: out_rx,
            inbound: in_tx,
        },
    )
}

impl SignalingPort {
    /// 로컬 후보 전송
    pub async fn send_candidate(&self, candidate: Candidate) -> Result<()> {
        self.outbound
            .send(SignalingOutbound::Candidate(candidate))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// 후보 수집 종료 표지 전송
    pub async fn send_end_of_candidates(&self) -> Result<()> {
        self.outbound
            .send(SignalingOutbound::EndOfCandidates)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// 불투명 협상 메시지 전송
    pub async fn send_negotiation(&self, payload: Bytes) -> Result<()> {
        self.outbound
            .send(SignalingOutbound::Negotiation(payload))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// 송신 핸들 복제 (태스크 분리용)
    pub fn outbound_sender(&self) -> mpsc::Sender<SignalingOutbound> {
        self.outbound.clone()
    }
}
