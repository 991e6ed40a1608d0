//! 전송 모니터
//!
//! 처리율/RTT/손실 샘플을 고정 폭 롤링 윈도우(샘플 수 또는 시간, 먼저 차는
//! 쪽)로 유지하고, 추가 때마다 통계를 재계산하여 watch 채널로 게시한다.
//! 품질 점수는 처리율 안정성 + 역손실 + 역지터의 가중 합이다.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::config::EngineConfig;
use crate::framer::LinkClass;

/// 롤링 윈도우 샘플 1건
#[derive(Debug, Clone, Copy)]
pub struct BenchmarkSample {
    /// 기록 시각
    pub timestamp: Instant,

    /// 직전 기록 이후 전송 바이트
    pub bytes_delta: u64,

    /// RTT 샘플 (밀리초)
    pub rtt_ms: Option<f64>,

    /// 손실 샘플 (0.0 ~ 1.0)
    pub loss: Option<f64>,
}

/// 병목 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bottleneck {
    /// 병목 없음
    #[default]
    None,

    /// 레인 송신 버퍼 포화 지속
    Backpressure,

    /// 경로 지연 과다 (손실 낮음)
    NetworkLatency,

    /// 링크 기대치 대비 처리율 정체
    NetworkBandwidth,

    /// 호출자 보고 CPU 과부하 (권고성)
    Cpu,

    /// 호출자 보고 메모리 과부하 (권고성)
    Memory,
}

impl Bottleneck {
    /// 병목 유형별 고정 권장 문구
    pub fn recommendation(&self) -> &'static str {
        match self {
            Bottleneck::None => "",
            Bottleneck::Backpressure => {
                "레인 송신 버퍼 포화가 지속됩니다. 청크 크기를 줄이거나 레인 수를 늘리세요."
            }
            Bottleneck::NetworkLatency => {
                "경로 지연이 높습니다. 릴레이 경유 여부를 확인하고 더 작은 청크를 사용하세요."
            }
            Bottleneck::NetworkBandwidth => {
                "링크 기대치보다 처리율이 낮습니다. 대역폭 상한과 경쟁 트래픽을 확인하세요."
            }
            Bottleneck::Cpu => "CPU 사용률이 임계값을 넘었습니다. 동시 전송 수를 줄이세요.",
            Bottleneck::Memory => {
                "메모리 사용률이 임계값을 넘었습니다. 수신 버퍼와 워터마크를 낮추세요."
            }
        }
    }
}

/// 윈도우 집계 결과
#[derive(Debug, Clone, Default)]
pub struct BenchmarkStats {
    /// 평균 처리율 (bytes/sec)
    pub avg_throughput: f64,

    /// 관측 최고 처리율 (bytes/sec)
    pub peak_throughput: f64,

    /// 최신 RTT (밀리초)
    pub current_rtt_ms: Option<f64>,

    /// 평균 손실률
    pub avg_packet_loss: f64,

    /// RTT 지터 (연속 샘플 차 평균, 밀리초)
    pub jitter_ms: f64,

    /// 품질 점수 (0 ~ 100)
    pub quality_score: u8,

    /// 병목 분류
    pub bottleneck: Bottleneck,

    /// 병목별 권장 문구
    pub recommendation: &'static str,

    /// 현재 링크 등급 (프레이머 신호용)
    pub link_class: LinkClass,
}

impl BenchmarkStats {
    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Throughput: {:.2} MB/s (peak {:.2}) | RTT: {} | Loss: {:.2}% | Jitter: {:.1}ms | Quality: {} | Bottleneck: {:?}",
            self.avg_throughput / 1_000_000.0,
            self.peak_throughput / 1_000_000.0,
            self.current_rtt_ms
                .map(|r| format!("{:.1}ms", r))
                .unwrap_or_else(|| "-".into()),
            self.avg_packet_loss * 100.0,
            self.jitter_ms,
            self.quality_score,
            self.bottleneck,
        )
    }
}

/// 내부 상태 (Mutex 보호)
struct MonitorInner {
    samples: VecDeque<BenchmarkSample>,
    saturation: VecDeque<bool>,
    peak_throughput: f64,
    cpu_load: Option<f64>,
    memory_load: Option<f64>,
    link_class: LinkClass,
    last_stats: BenchmarkStats,
}

/// 전송 모니터
pub struct TransferMonitor {
    config: EngineConfig,
    inner: Mutex<MonitorInner>,
    stats_tx: watch::Sender<BenchmarkStats>,
}

impl TransferMonitor {
    pub fn new(config: EngineConfig) -> Self {
        let (stats_tx, _) = watch::channel(BenchmarkStats::default());
        Self {
            config,
            inner: Mutex::new(MonitorInner {
                samples: VecDeque::new(),
                saturation: VecDeque::new(),
                peak_throughput: 0.0,
                cpu_load: None,
                memory_load: None,
                link_class: LinkClass::Unknown,
                last_stats: BenchmarkStats::default(),
            }),
            stats_tx,
        }
    }

    /// 전송 바이트 기록
    pub fn record_bytes(&self, n: u64) {
        self.push_sample(BenchmarkSample {
            timestamp: Instant::now(),
            bytes_delta: n,
            rtt_ms: None,
            loss: None,
        });
    }

    /// RTT 샘플 기록 (밀리초)
    pub fn record_rtt_sample(&self, rtt_ms: f64) {
        self.push_sample(BenchmarkSample {
            timestamp: Instant::now(),
            bytes_delta: 0,
            rtt_ms: Some(rtt_ms),
            loss: None,
        });
    }

    /// 손실 샘플 기록
    pub fn record_loss_sample(&self, loss: f64) {
        self.push_sample(BenchmarkSample {
            timestamp: Instant::now(),
            bytes_delta: 0,
            rtt_ms: None,
            loss: Some(loss.clamp(0.0, 1.0)),
        });
    }

    /// 레인 포화 여부 기록 (send_chunk 선택 시점마다)
    pub fn record_lane_saturation(&self, saturated: bool) {
        let mut inner = self.inner.lock();
        inner.saturation.push_back(saturated);
        while inner.saturation.len() > self.config.monitor_window_samples {
            inner.saturation.pop_front();
        }
        self.recompute(&mut inner);
    }

    /// 호출자 제공 리소스 텔레메트리 (0.0 ~ 1.0)
    pub fn record_resource_telemetry(&self, cpu_load: f64, memory_load: f64) {
        let mut inner = self.inner.lock();
        inner.cpu_load = Some(cpu_load);
        inner.memory_load = Some(memory_load);
        self.recompute(&mut inner);
    }

    /// 링크 등급 설정 (링크 수립 결과 기반)
    pub fn set_link_class(&self, link_class: LinkClass) {
        let mut inner = self.inner.lock();
        inner.link_class = link_class;
        debug!("링크 등급 설정: {:?}", link_class);
        self.recompute(&mut inner);
    }

    /// 현재 통계
    pub fn stats(&self) -> BenchmarkStats {
        self.inner.lock().last_stats.clone()
    }

    /// 통계 게시 구독
    pub fn subscribe(&self) -> watch::Receiver<BenchmarkStats> {
        self.stats_tx.subscribe()
    }

    fn push_sample(&self, sample: BenchmarkSample) {
        let mut inner = self.inner.lock();
        inner.samples.push_back(sample);
        self.trim(&mut inner);
        self.recompute(&mut inner);
    }

    /// 윈도우 정리: 샘플 수 또는 시간 폭, 먼저 차는 쪽 기준
    fn trim(&self, inner: &mut MonitorInner) {
        while inner.samples.len() > self.config.monitor_window_samples {
            inner.samples.pop_front();
        }

        let now = Instant::now();
        let window = std::time::Duration::from_millis(self.config.monitor_window_ms);
        while let Some(front) = inner.samples.front() {
            if now.duration_since(front.timestamp) > window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn recompute(&self, inner: &mut MonitorInner) {
        let avg_throughput = Self::window_throughput(&inner.samples);
        if avg_throughput > inner.peak_throughput {
            inner.peak_throughput = avg_throughput;
        }

        let rtts: Vec<f64> = inner.samples.iter().filter_map(|s| s.rtt_ms).collect();
        let current_rtt_ms = rtts.last().copied();

        let jitter_ms = if rtts.len() >= 2 {
            rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / (rtts.len() - 1) as f64
        } else {
            0.0
        };

        let losses: Vec<f64> = inner.samples.iter().filter_map(|s| s.loss).collect();
        let avg_packet_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        };

        let quality_score =
            Self::quality_score(&inner.samples, avg_throughput, avg_packet_loss, jitter_ms);

        let bottleneck = self.classify_bottleneck(inner, avg_throughput, current_rtt_ms, avg_packet_loss);

        let stats = BenchmarkStats {
            avg_throughput,
            peak_throughput: inner.peak_throughput,
            current_rtt_ms,
            avg_packet_loss,
            jitter_ms,
            quality_score,
            bottleneck,
            recommendation: bottleneck.recommendation(),
            link_class: inner.link_class,
        };

        inner.last_stats = stats.clone();
        let _ = self.stats_tx.send(stats);
    }

    /// 윈도우 평균 처리율 (bytes/sec)
    fn window_throughput(samples: &VecDeque<BenchmarkSample>) -> f64 {
        if samples.len() < 2 {
            return 0.0;
        }

        let first = samples.front().map(|s| s.timestamp);
        let last = samples.back().map(|s| s.timestamp);
        let (first, last) = match (first, last) {
            (Some(f), Some(l)) => (f, l),
            _ => return 0.0,
        };

        let duration = last.duration_since(first);
        if duration.is_zero() {
            return 0.0;
        }

        let total: u64 = samples.iter().map(|s| s.bytes_delta).sum();
        total as f64 / duration.as_secs_f64()
    }

    /// 품질 점수: 처리율 안정성 0.4 + 역손실 0.35 + 역지터 0.25
    fn quality_score(
        samples: &VecDeque<BenchmarkSample>,
        avg_throughput: f64,
        avg_loss: f64,
        jitter_ms: f64,
    ) -> u8 {
        // 바이트 샘플 간 구간 처리율의 분산으로 안정성 추정
        let mut rates = Vec::new();
        let byte_samples: Vec<&BenchmarkSample> =
            samples.iter().filter(|s| s.bytes_delta > 0).collect();
        for pair in byte_samples.windows(2) {
            let dt = pair[1].timestamp.duration_since(pair[0].timestamp).as_secs_f64();
            if dt > 0.0 {
                rates.push(pair[1].bytes_delta as f64 / dt);
            }
        }

        let stability = if rates.len() < 2 || avg_throughput <= 0.0 {
            // 관측 부족 시 중립값
            0.5
        } else {
            let mean = rates.iter().sum::<f64>() / rates.len() as f64;
            let variance =
                rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rates.len() as f64;
            let cv = variance.sqrt() / mean.max(1.0);
            (1.0 - cv).clamp(0.0, 1.0)
        };

        let loss_term = (1.0 - avg_loss * 5.0).clamp(0.0, 1.0);
        let jitter_term = (1.0 - jitter_ms / 50.0).clamp(0.0, 1.0);

        let score = (stability * 0.4 + loss_term * 0.35 + jitter_term * 0.25) * 100.0;
        score.clamp(0.0, 100.0) as u8
    }

    /// 병목 분류 (우선순위 순)
    fn classify_bottleneck(
        &self,
        inner: &MonitorInner,
        avg_throughput: f64,
        current_rtt_ms: Option<f64>,
        avg_loss: f64,
    ) -> Bottleneck {
        // 1. 백프레셔: 윈도우의 절반 초과가 포화 관측
        if !inner.saturation.is_empty() {
            let saturated = inner.saturation.iter().filter(|&&s| s).count();
            if saturated * 2 > inner.saturation.len() {
                return Bottleneck::Backpressure;
            }
        }

        // 2. 네트워크 지연: RTT 상한 초과 + 손실 낮음
        if let Some(rtt) = current_rtt_ms {
            if rtt > self.config.rtt_ceiling_ms && avg_loss < 0.05 {
                return Bottleneck::NetworkLatency;
            }
        }

        // 3. 네트워크 대역폭: RTT/손실이 낮은데 기대치 대비 정체
        let low_rtt = current_rtt_ms
            .map(|r| r < self.config.rtt_ceiling_ms * 0.5)
            .unwrap_or(false);
        if low_rtt
            && avg_loss < 0.02
            && avg_throughput > 0.0
            && avg_throughput < inner.link_class.expected_throughput() * 0.3
        {
            return Bottleneck::NetworkBandwidth;
        }

        // 4. 권고성 리소스 병목
        if inner.cpu_load.map(|c| c >= self.config.cpu_threshold).unwrap_or(false) {
            return Bottleneck::Cpu;
        }
        if inner
            .memory_load
            .map(|m| m >= self.config.memory_threshold)
            .unwrap_or(false)
        {
            return Bottleneck::Memory;
        }

        Bottleneck::None
    }
}
