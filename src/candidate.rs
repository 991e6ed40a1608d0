//! 연결 후보 정의와 수집
//!
//! - Host: 로컬 인터페이스 주소
//! - ServerReflexive: 프로브 서버가 관측한 외부 매핑
//! - PeerReflexive: 연결성 검사 중 상대가 관측한 매핑
//! - Relay: 제3자 포워딩 서버 경유
//!
//! 후보는 점진적으로 수집되어 시그널링 협력자를 통해 교환된다.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::warn;

use crate::stun;
use crate::Result;

/// Host 후보 우선순위
pub const PRIORITY_HOST: u32 = 100;
/// ServerReflexive 후보 우선순위
pub const PRIORITY_SERVER_REFLEXIVE: u32 = 50;
/// PeerReflexive 후보 우선순위
pub const PRIORITY_PEER_REFLEXIVE: u32 = 40;
/// Relay 후보 우선순위
pub const PRIORITY_RELAY: u32 = 30;
/// 전략이 릴레이를 선호할 때의 Relay 후보 우선순위
pub const PRIORITY_RELAY_PREFERRED: u32 = 200;

/// 후보 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateKind {
    /// 로컬 주소
    Host,

    /// 외부 관측 매핑 (프로브 서버 기준)
    ServerReflexive,

    /// 외부 관측 매핑 (상대 기준)
    PeerReflexive,

    /// 릴레이 서버 경유
    Relay,
}

/// 연결 후보
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// 후보 종류
    pub kind: CandidateKind,

    /// 주소 + 포트
    pub addr: SocketAddr,

    /// 우선순위 (높을수록 선호)
    pub priority: u32,
}

impl Candidate {
    pub fn new(kind: CandidateKind, addr: SocketAddr, priority: u32) -> Self {
        Self {
            kind,
            addr,
            priority,
        }
    }

    /// 릴레이 후보 생성 (선호 여부에 따라 우선순위 결정)
    pub fn relay(addr: SocketAddr, preferred: bool) -> Self {
        let priority = if preferred {
            PRIORITY_RELAY_PREFERRED
        } else {
            PRIORITY_RELAY
        };
        Self::new(CandidateKind::Relay, addr, priority)
    }
}

/// 로컬×원격 후보 쌍
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate) -> Self {
        Self { local, remote }
    }

    /// 쌍 우선순위: 양쪽 우선순위 합
    pub fn priority(&self) -> u64 {
        self.local.priority as u64 + self.remote.priority as u64
    }

    /// 릴레이 경유 쌍인지
    pub fn is_relayed(&self) -> bool {
        self.local.kind == CandidateKind::Relay || self.remote.kind == CandidateKind::Relay
    }
}

/// 기본 라우트 기준 로컬 IP 탐색
///
/// 외부 주소로 connect한 UDP 소켓의 로컬 주소를 읽는다 (패킷 전송 없음)
pub fn local_ip() -> Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

/// Host 후보 생성
pub fn host_candidate(local_port: u16) -> Option<Candidate> {
    match local_ip() {
        Ok(ip) => Some(Candidate::new(
            CandidateKind::Host,
            SocketAddr::new(ip, local_port),
            PRIORITY_HOST,
        )),
        Err(e) => {
            warn!("로컬 IP 탐색 실패: {}", e);
            None
        }
    }
}

/// ServerReflexive 후보 수집
///
/// 세션에 쓸 소켓과 같은 포트로 질의해야 매핑이 실제 경로와 일치한다
pub async fn server_reflexive_candidate(
    socket: &UdpSocket,
    probe_server: SocketAddr,
    timeout: Duration,
) -> Option<Candidate> {
    match stun::query(socket, probe_server, timeout).await {
        Ok(mapped) => Some(Candidate::new(
            CandidateKind::ServerReflexive,
            mapped,
            PRIORITY_SERVER_REFLEXIVE,
        )),
        Err(e) => {
            warn!("반사 후보 수집 실패: server={}, {}", probe_server, e);
            None
        }
    }
}

/// 우선순위 내림차순 정렬
pub fn sort_by_priority(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}
