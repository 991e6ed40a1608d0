//! 적응형 프레이머
//!
//! RTT/손실률/링크 등급에서 청크 크기를 선택한다.
//! 측정 지터로 인한 진동을 막기 위해 평가당 버킷 한 칸까지만 이동한다.

use parking_lot::Mutex;
use tracing::debug;

/// 청크 크기 버킷 (오름차순)
const BUCKETS: [usize; 8] = [
    16 * 1024,        // >= 200ms
    32 * 1024,        // < 200ms
    64 * 1024,        // < 100ms, loss < 0.10
    128 * 1024,       // < 50ms, loss < 0.05
    256 * 1024,       // < 10ms
    1024 * 1024,      // LAN 보수적
    2 * 1024 * 1024,  // LAN 균형
    4 * 1024 * 1024,  // LAN 공격적
];

/// LAN 청크 크기 공격성
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggressiveness {
    /// 1MiB 상한
    Conservative,

    /// 2MiB 상한
    Balanced,

    /// 4MiB 상한
    Aggressive,
}

/// 링크 등급
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkClass {
    /// 로컬 네트워크
    Lan,

    /// 광역 네트워크
    Wan,

    /// 판별 전
    #[default]
    Unknown,
}

impl LinkClass {
    /// 등급별 기대 처리율 (bytes/sec, 병목 판정 기준)
    pub fn expected_throughput(&self) -> f64 {
        match self {
            LinkClass::Lan => 100_000_000.0, // ~800Mbps
            LinkClass::Wan => 12_500_000.0,  // ~100Mbps
            LinkClass::Unknown => 6_250_000.0,
        }
    }
}

/// 네트워크 신호 → 목표 버킷 인덱스 (선택 테이블, 구체적 조건 우선)
fn target_bucket(rtt_ms: f64, loss_ratio: f64, link_class: LinkClass, aggr: Aggressiveness) -> usize {
    if link_class == LinkClass::Lan && loss_ratio < 0.01 {
        return match aggr {
            Aggressiveness::Conservative => 5, // 1MiB
            Aggressiveness::Balanced => 6,     // 2MiB
            Aggressiveness::Aggressive => 7,   // 4MiB
        };
    }

    if rtt_ms < 10.0 {
        4 // 256KiB
    } else if rtt_ms < 50.0 && loss_ratio < 0.05 {
        3 // 128KiB
    } else if rtt_ms < 100.0 && loss_ratio < 0.10 {
        2 // 64KiB
    } else if rtt_ms < 200.0 {
        1 // 32KiB
    } else {
        0 // 16KiB
    }
}

/// 적응형 프레이머
pub struct AdaptiveFramer {
    aggressiveness: Aggressiveness,
    current_bucket: Mutex<usize>,
}

impl AdaptiveFramer {
    /// 새 프레이머 생성 (중간 버킷에서 시작)
    pub fn new(aggressiveness: Aggressiveness) -> Self {
        Self {
            aggressiveness,
            current_bucket: Mutex::new(2), // 64KiB
        }
    }

    /// 현재 청크 크기 (바이트)
    pub fn current_chunk_size(&self) -> usize {
        BUCKETS[*self.current_bucket.lock()]
    }

    /// 네트워크 신호 보고 → 크기 재평가
    ///
    /// 평가당 한 버킷까지만 이동 (양방향 공통)
    pub fn report_signal(&self, rtt_ms: f64, loss_ratio: f64, link_class: LinkClass) {
        let target = target_bucket(rtt_ms, loss_ratio, link_class, self.aggressiveness);

        let mut current = self.current_bucket.lock();
        let previous = *current;

        *current = match target.cmp(&previous) {
            std::cmp::Ordering::Greater => previous + 1,
            std::cmp::Ordering::Less => previous - 1,
            std::cmp::Ordering::Equal => previous,
        };

        if *current != previous {
            debug!(
                "청크 크기 조정: {} -> {} (rtt={:.1}ms, loss={:.3}, {:?})",
                BUCKETS[previous], BUCKETS[*current], rtt_ms, loss_ratio, link_class
            );
        }
    }
}
