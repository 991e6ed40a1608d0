//! 엔진 설정

use std::net::SocketAddr;
use std::time::Duration;

use crate::framer::Aggressiveness;
use crate::{DEFAULT_LANE_COUNT, HIGH_WATERMARK, LOW_WATERMARK, MAX_LANE_COUNT};

/// 기본 프로브 서버 목록 (STUN 호환)
pub const DEFAULT_PROBE_SERVERS: [&str; 4] = [
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// LXP 엔진 설정
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 목표 레인 수 (1~4)
    pub lane_count: usize,

    /// 레인 송신 버퍼 상한 워터마크 (바이트)
    pub high_watermark: usize,

    /// 레인 송신 버퍼 하한 워터마크 (바이트)
    pub low_watermark: usize,

    /// NAT 프로브 응답 대기 윈도우 (밀리초, 0이면 반사 후보 수집 생략)
    pub probe_window_ms: u64,

    /// 필터링 프로브 응답 대기 (밀리초)
    pub filtering_probe_timeout_ms: u64,

    /// 릴레이 후보용 사전 설정 릴레이 서버 주소
    pub relay_servers: Vec<SocketAddr>,

    /// 릴레이 캐스케이드 단계별 타임아웃 (밀리초)
    pub relay_stage_timeout_ms: u64,

    /// 원격 후보 최초 도착 대기 타임아웃 (밀리초)
    pub signaling_timeout_ms: u64,

    /// 링크 재수립 최대 재시도 횟수
    pub max_link_retries: u32,

    /// 재시도 백오프 기본 단위 (밀리초, 선형: attempt × base)
    pub retry_backoff_base_ms: u64,

    /// 재시도 백오프 상한 (밀리초)
    pub retry_backoff_cap_ms: u64,

    /// 모니터 윈도우 샘플 수
    pub monitor_window_samples: usize,

    /// 모니터 윈도우 시간 폭 (밀리초)
    pub monitor_window_ms: u64,

    /// 네트워크 지연 병목 판정 RTT 상한 (밀리초)
    pub rtt_ceiling_ms: f64,

    /// CPU 병목 권고 임계값 (0.0 ~ 1.0)
    pub cpu_threshold: f64,

    /// 메모리 병목 권고 임계값 (0.0 ~ 1.0)
    pub memory_threshold: f64,

    /// 레인 RTT 프로브 주기 (밀리초)
    pub lane_probe_interval_ms: u64,

    /// 미완 전송 버퍼 보존 타임아웃 (밀리초)
    ///
    /// 이 시간을 넘긴 미완 재조립기와 송신측 보존 청크를 제거한다
    pub reassembly_timeout_ms: u64,

    /// 프레이머 공격성 (LAN 청크 크기 상한 결정)
    pub aggressiveness: Aggressiveness,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lane_count: DEFAULT_LANE_COUNT,
            high_watermark: HIGH_WATERMARK,
            low_watermark: LOW_WATERMARK,
            probe_window_ms: 3000,
            filtering_probe_timeout_ms: 500,
            relay_servers: Vec::new(),
            relay_stage_timeout_ms: 3000,
            signaling_timeout_ms: 10000,
            max_link_retries: 5,
            retry_backoff_base_ms: 2000,   // attempt × 2초
            retry_backoff_cap_ms: 10000,   // 최대 10초
            monitor_window_samples: 20,
            monitor_window_ms: 5000,
            rtt_ceiling_ms: 250.0,
            cpu_threshold: 0.90,
            memory_threshold: 0.90,
            lane_probe_interval_ms: 1000,
            reassembly_timeout_ms: 30000,
            aggressiveness: Aggressiveness::Balanced,
        }
    }
}

impl EngineConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 유효 레인 수 (1~4로 클램프)
    pub fn clamped_lane_count(&self) -> usize {
        self.lane_count.clamp(1, MAX_LANE_COUNT)
    }

    /// 재시도 백오프 계산 (선형, 상한 적용)
    ///
    /// attempt는 1부터 시작
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let ms = (attempt as u64 * self.retry_backoff_base_ms).min(self.retry_backoff_cap_ms);
        Duration::from_millis(ms)
    }

    /// LAN 환경용 설정
    pub fn lan() -> Self {
        Self {
            aggressiveness: Aggressiveness::Aggressive,
            probe_window_ms: 1500,
            signaling_timeout_ms: 5000,
            rtt_ceiling_ms: 50.0,
            lane_probe_interval_ms: 500,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            lane_count: MAX_LANE_COUNT,
            aggressiveness: Aggressiveness::Conservative,
            probe_window_ms: 5000,
            filtering_probe_timeout_ms: 1000,
            relay_stage_timeout_ms: 5000,
            signaling_timeout_ms: 15000,
            retry_backoff_base_ms: 3000,
            monitor_window_samples: 30,
            rtt_ceiling_ms: 400.0,
            lane_probe_interval_ms: 2000,
            reassembly_timeout_ms: 60000,
            ..Self::default()
        }
    }
}
