//! NAT 분류기
//!
//! 서로 다른 프로브 서버 2개 이상에 바인딩 질의를 보내 외부 매핑 포트의
//! 일관성을 비교한다.
//! - 매핑 관측 0건 ⇒ Blocked
//! - 모든 서버에서 외부 포트 동일 ⇒ 콘형 (필터링 프로브 성공 시에만 FullCone,
//!   아니면 보수적으로 AddressRestricted)
//! - 서버별로 외부 포트 상이 ⇒ Symmetric
//!
//! 분류는 링크 시도마다 재실행하며 장기 캐시하지 않는다.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::stun;
use crate::{Error, Result};

/// NAT 분류 결과 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatClass {
    /// 풀콘 (제3자 인바운드 허용)
    FullCone,

    /// 주소 제한 콘형
    AddressRestricted,

    /// 포트 제한 콘형
    PortRestricted,

    /// 대칭형 (목적지별 매핑 상이)
    Symmetric,

    /// 외부 매핑 관측 불가
    Blocked,

    /// 판별 불가
    Unknown,
}

/// 분류 신뢰도
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Low,
}

/// NAT 분류 + 신뢰도
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatClassification {
    pub class: NatClass,
    pub confidence: Confidence,
}

impl NatClassification {
    pub fn new(class: NatClass, confidence: Confidence) -> Self {
        Self { class, confidence }
    }

    /// 릴레이 없이는 도달 불가인지
    pub fn is_blocked(&self) -> bool {
        self.class == NatClass::Blocked
    }
}

/// 프로브 관측 1건 (서버 1개 기준)
///
/// 분류 중에만 생성되고 분류 완료 후 폐기됨
#[derive(Debug, Clone)]
pub struct NatProbeResult {
    /// 로컬 소스 포트
    pub local_port: u16,

    /// 외부에서 관측된 매핑 주소
    pub mapped: SocketAddr,

    /// 프로브 서버 식별 (주소)
    pub server: SocketAddr,

    /// 왕복 지연
    pub rtt: Duration,
}

/// 관측 집합 → 분류 (순수 함수)
///
/// `filtering_probe_ok`: 응답한 서버의 미접촉 포트에 보낸 필터링 프로브가
/// 응답을 받았는지 여부. 콘형 판정 시 FullCone/AddressRestricted를 가른다.
pub fn classify_observations(
    observations: &[NatProbeResult],
    filtering_probe_ok: bool,
) -> NatClassification {
    if observations.is_empty() {
        return NatClassification::new(NatClass::Blocked, Confidence::High);
    }

    if observations.len() < 2 {
        // 포트 일관성 비교 불가
        return NatClassification::new(NatClass::Unknown, Confidence::Low);
    }

    let first_port = observations[0].mapped.port();
    let uniform = observations.iter().all(|o| o.mapped.port() == first_port);

    let confidence = if observations.len() >= 3 {
        Confidence::High
    } else {
        Confidence::Low
    };

    if uniform {
        // 콘형: 순수 클라이언트는 비요청 인바운드 도달성을 직접 관측할 수 없으므로
        // 필터링 프로브가 성공한 경우에만 FullCone으로 판정
        if filtering_probe_ok {
            NatClassification::new(NatClass::FullCone, confidence)
        } else {
            NatClassification::new(NatClass::AddressRestricted, confidence)
        }
    } else {
        NatClassification::new(NatClass::Symmetric, confidence)
    }
}

/// NAT 분류기
pub struct Classifier {
    config: EngineConfig,
}

impl Classifier {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// 프로브 서버들에 질의하여 NAT 분류
    ///
    /// 서로 다른 서버 2개 이상의 응답이 윈도우 안에 필요하다.
    /// 응답 0건이면 Blocked, 정확히 1건이면 `InsufficientProbes`.
    pub async fn classify(&self, probe_servers: &[SocketAddr]) -> Result<NatClassification> {
        if probe_servers.len() < 2 {
            return Err(Error::InsufficientProbes {
                responded: 0,
                required: 2,
            });
        }

        // 소켓 하나를 재사용해야 동일 소스 포트 기준으로 매핑 포트 비교가 성립
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let local_port = socket.local_addr()?.port();

        let window = Duration::from_millis(self.config.probe_window_ms);
        let deadline = Instant::now() + window;

        let mut observations = Vec::with_capacity(probe_servers.len());

        for &server in probe_servers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            // 서버당 타임아웃: 남은 윈도우를 남은 서버 수로 분배
            let pending = probe_servers.len() - observations.len();
            let per_server = remaining / pending.max(1) as u32;

            let started = Instant::now();
            match stun::query(&socket, server, per_server).await {
                Ok(mapped) => {
                    let rtt = started.elapsed();
                    debug!("프로브 응답: server={}, mapped={}, rtt={:?}", server, mapped, rtt);
                    observations.push(NatProbeResult {
                        local_port,
                        mapped,
                        server,
                        rtt,
                    });
                }
                Err(e) => {
                    warn!("프로브 실패: server={}, {}", server, e);
                }
            }
        }

        if observations.is_empty() {
            debug!("외부 매핑 관측 0건 → Blocked");
            return Ok(NatClassification::new(NatClass::Blocked, Confidence::High));
        }

        if observations.len() < 2 {
            return Err(Error::InsufficientProbes {
                responded: observations.len(),
                required: 2,
            });
        }

        // 필터링 프로브: 응답한 서버의 인접(미접촉) 포트로 질의
        let filtering_probe_ok = self.run_filtering_probe(&socket, &observations).await;

        let classification = classify_observations(&observations, filtering_probe_ok);
        debug!(
            "NAT 분류: {:?} (관측 {}건, 필터링 프로브 {})",
            classification.class,
            observations.len(),
            if filtering_probe_ok { "성공" } else { "실패" }
        );

        Ok(classification)
    }

    /// 필터링 프로브 실행
    ///
    /// 선행 아웃바운드가 없던 포트에서 응답이 오면 주소/포트 필터링이
    /// 느슨하다는 뜻이므로 FullCone 판정 근거가 된다.
    async fn run_filtering_probe(
        &self,
        socket: &UdpSocket,
        observations: &[NatProbeResult],
    ) -> bool {
        let base = observations[0].server;
        let alt = SocketAddr::new(base.ip(), base.port().wrapping_add(1));
        let timeout = Duration::from_millis(self.config.filtering_probe_timeout_ms);

        stun::query(socket, alt, timeout).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(server: &str, mapped: &str) -> NatProbeResult {
        NatProbeResult {
            local_port: 40000,
            mapped: mapped.parse().unwrap(),
            server: server.parse().unwrap(),
            rtt: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_no_observations_is_blocked() {
        let c = classify_observations(&[], false);
        assert_eq!(c.class, NatClass::Blocked);
        assert_eq!(c.confidence, Confidence::High);
    }

    #[test]
    fn test_uniform_ports_conservative_address_restricted() {
        let obs = [
            observation("1.1.1.1:3478", "203.0.113.7:40000"),
            observation("2.2.2.2:3478", "203.0.113.7:40000"),
        ];
        let c = classify_observations(&obs, false);
        assert_eq!(c.class, NatClass::AddressRestricted);
    }

    #[test]
    fn test_uniform_ports_with_filtering_probe_is_full_cone() {
        let obs = [
            observation("1.1.1.1:3478", "203.0.113.7:40000"),
            observation("2.2.2.2:3478", "203.0.113.7:40000"),
            observation("3.3.3.3:3478", "203.0.113.7:40000"),
        ];
        let c = classify_observations(&obs, true);
        assert_eq!(c.class, NatClass::FullCone);
        assert_eq!(c.confidence, Confidence::High);
    }

    #[test]
    fn test_varying_ports_is_symmetric() {
        let obs = [
            observation("1.1.1.1:3478", "203.0.113.7:40001"),
            observation("2.2.2.2:3478", "203.0.113.7:40777"),
        ];
        let c = classify_observations(&obs, false);
        assert_eq!(c.class, NatClass::Symmetric);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let obs = [
            observation("1.1.1.1:3478", "203.0.113.7:40000"),
            observation("2.2.2.2:3478", "203.0.113.7:40000"),
        ];
        let first = classify_observations(&obs, false);
        for _ in 0..10 {
            assert_eq!(classify_observations(&obs, false), first);
        }
    }

    #[tokio::test]
    async fn test_classify_requires_two_servers() {
        let classifier = Classifier::new(EngineConfig::default());
        let servers = ["127.0.0.1:3478".parse().unwrap()];
        let result = classifier.classify(&servers).await;
        assert!(matches!(
            result,
            Err(Error::InsufficientProbes { required: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_classify_unreachable_servers_is_blocked() {
        let mut config = EngineConfig::default();
        config.probe_window_ms = 200;
        config.filtering_probe_timeout_ms = 50;
        let classifier = Classifier::new(config);

        // 응답 없는 루프백 포트 → 매핑 관측 0건
        let servers: Vec<SocketAddr> = vec![
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        ];
        let c = classifier.classify(&servers).await.unwrap();
        assert_eq!(c.class, NatClass::Blocked);
    }
}
