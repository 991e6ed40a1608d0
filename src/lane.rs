//! 레인 관리자
//!
//! 수립된 링크 위에 병렬 비신뢰 레인 N개를 열고 청크를 분산한다.
//! - 라운드로빈 배분, 상한 워터마크 초과 레인은 한 바퀴 제외
//! - 모든 적격 레인이 포화면 하한 워터마크 배수 신호까지 송신 대기
//! - 레인 송신 실패는 내부에서 회전 복구하며, 활성 레인이 0이 될 때만
//!   링크 계층에 Disconnected 재진입을 요청
//! - 수신 재조립은 레인 무관, 무결성 실패 인덱스만 단건 재요청

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::{split_into_chunks, Chunk, InsertOutcome, Reassembler};
use crate::config::EngineConfig;
use crate::framer::AdaptiveFramer;
use crate::link::{LinkHandle, LinkState};
use crate::monitor::TransferMonitor;
use crate::wire::{Frame, ProbeMessage, RerequestMessage, TransferCompleteMessage};
use crate::{Error, Result};

/// 레인 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneRole {
    /// 첫 레인
    Primary,

    /// 추가 레인
    Secondary,
}

/// 레인 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Open,
    Paused,
    Closed,
}

/// 레인 전송 기질
///
/// 메시지 지향 + 비순서 + 전송 계층 무재전송을 가정한다.
/// 신뢰성은 전적으로 청크의 시퀀스 인덱스/다이제스트 체계가 담당한다.
pub trait LaneTransport: Send + Sync + 'static {
    /// 해당 레인으로 프레임 1건 전송
    fn send(&self, lane_id: u8, frame: Bytes) -> impl Future<Output = Result<()>> + Send;
}

/// 전송 이벤트 (수신측 → 호출자)
#[derive(Debug)]
pub enum TransferEvent {
    /// 전송 완료 (시퀀스 인덱스 순 연결 바이트)
    Completed { transfer_id: u64, data: Bytes },

    /// 재요청까지 실패한 무결성 불일치 (데이터 손상 신호)
    Corrupt {
        transfer_id: u64,
        sequence_index: u64,
    },
}

/// 레인 공유 상태 (워커/관리자 공동 접근)
struct LaneShared {
    id: u8,
    role: LaneRole,
    state: Mutex<LaneState>,
    /// 송신 큐 적체 바이트
    buffered: AtomicUsize,
    /// 상한 워터마크 래치 (하한 배수까지 제외 유지)
    paused: AtomicBool,
    next_send_seq: AtomicU64,
    next_recv_seq: AtomicU64,
}

impl LaneShared {
    fn state(&self) -> LaneState {
        *self.state.lock()
    }

    fn close(&self) {
        *self.state.lock() = LaneState::Closed;
    }

    fn is_open(&self) -> bool {
        self.state() == LaneState::Open
    }
}

/// 레인 항목 (관리자 소유)
struct LaneEntry {
    shared: Arc<LaneShared>,
    queue: mpsc::Sender<Bytes>,
}

/// 레인 선택 결과
///
/// `Lane`은 적격성 검사와 동시에 프레임 길이만큼 적체 바이트를
/// 이미 예약한 상태다 (송신 실패 시 호출측이 해제)
enum Pick {
    Lane {
        shared: Arc<LaneShared>,
        queue: mpsc::Sender<Bytes>,
    },
    AllSaturated,
    NoneOpen,
}

/// 송신측 재요청용 보존 청크 묶음
struct OutgoingTransfer {
    chunks: HashMap<u64, Chunk>,
    created_at: Instant,
}

/// 무결성 재요청 추적 키
type RerequestKey = (u64, u64);

/// 레인 관리자
pub struct LaneManager<T: LaneTransport> {
    config: EngineConfig,
    transport: Arc<T>,
    link: Arc<LinkHandle>,
    monitor: Arc<TransferMonitor>,

    /// 활성 레인 집합 (열림/닫힘 이벤트에서만 관리자에 의해 변이)
    lanes: RwLock<Vec<LaneEntry>>,

    /// 라운드로빈 커서
    rr_cursor: AtomicUsize,

    /// 하한 워터마크 배수 알림
    drained: Notify,

    /// 링크 상태 신호에 따라 청크 크기를 조정하는 프레이머
    framer: AdaptiveFramer,

    /// 송신측: TransferComplete까지 보존하는 재요청용 청크
    outgoing: DashMap<u64, OutgoingTransfer>,

    /// 수신측: 전송별 재조립기
    reassembly: DashMap<u64, Reassembler>,

    /// 인덱스별 재요청 시도 여부 (단건 1회 한정)
    rerequested: DashMap<RerequestKey, ()>,

    /// 실패 레인에서 회수된 프레임 재배분 큐
    retry_tx: mpsc::UnboundedSender<Bytes>,

    /// 완료/손상 이벤트
    events_tx: mpsc::Sender<TransferEvent>,

    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: LaneTransport> LaneManager<T> {
    /// 새 레인 관리자 생성
    ///
    /// 링크가 Connected 상태여야 한다. 레인은 생성 즉시 열린다.
    pub fn new(
        config: EngineConfig,
        transport: Arc<T>,
        link: Arc<LinkHandle>,
        monitor: Arc<TransferMonitor>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransferEvent>)> {
        if link.state() != LinkState::Connected {
            return Err(Error::LinkNotConnected {
                state: link.state().name(),
            });
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            framer: AdaptiveFramer::new(config.aggressiveness),
            config: config.clone(),
            transport,
            link,
            monitor,
            lanes: RwLock::new(Vec::new()),
            rr_cursor: AtomicUsize::new(0),
            drained: Notify::new(),
            outgoing: DashMap::new(),
            reassembly: DashMap::new(),
            rerequested: DashMap::new(),
            retry_tx,
            events_tx,
            running: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        });

        let lane_count = config.clamped_lane_count();
        for i in 0..lane_count {
            manager.open_lane(i as u8);
        }
        info!("레인 관리자 시작: {} 레인", lane_count);

        manager.spawn_retry_task(retry_rx);
        manager.spawn_adaptation_task();
        manager.spawn_eviction_task();

        Ok((manager, events_rx))
    }

    /// 레인 1개 개설 + 워커 기동
    fn open_lane(self: &Arc<Self>, id: u8) {
        let role = if id == 0 {
            LaneRole::Primary
        } else {
            LaneRole::Secondary
        };

        let shared = Arc::new(LaneShared {
            id,
            role,
            state: Mutex::new(LaneState::Open),
            buffered: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            next_send_seq: AtomicU64::new(0),
            next_recv_seq: AtomicU64::new(0),
        });

        debug!("레인 {} 개설 ({:?})", id, role);
        let (queue_tx, queue_rx) = mpsc::channel::<Bytes>(1024);

        let worker = self.clone().spawn_lane_worker(shared.clone(), queue_rx);
        self.tasks.lock().push(worker);

        self.lanes.write().push(LaneEntry {
            shared,
            queue: queue_tx,
        });
    }

    /// 레인 워커: 큐 → 전송, 실패 시 레인 폐쇄 + 잔여 프레임 회수
    fn spawn_lane_worker(
        self: Arc<Self>,
        shared: Arc<LaneShared>,
        mut queue_rx: mpsc::Receiver<Bytes>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = queue_rx.recv().await {
                let len = frame.len();

                match self.transport.send(shared.id, frame.clone()).await {
                    Ok(()) => {
                        let before = shared.buffered.fetch_sub(len, Ordering::AcqRel);
                        let now = before.saturating_sub(len);

                        // 하한 배수 → 래치 해제 + 송신 대기자 깨움
                        if shared.paused.load(Ordering::Acquire)
                            && now < self.config.low_watermark
                        {
                            shared.paused.store(false, Ordering::Release);
                            self.drained.notify_waiters();
                        } else if now < self.config.low_watermark {
                            self.drained.notify_waiters();
                        }
                    }
                    Err(e) => {
                        warn!("레인 {} 송신 실패, 폐쇄: {}", shared.id, e);
                        shared.close();
                        shared.buffered.store(0, Ordering::Release);

                        // 실패 프레임 + 잔여 큐를 재배분으로 회수
                        let _ = self.retry_tx.send(frame);
                        while let Ok(pending) = queue_rx.try_recv() {
                            let _ = self.retry_tx.send(pending);
                        }
                        self.drained.notify_waiters();
                        return;
                    }
                }
            }
        })
    }

    /// 회수 프레임 재배분 태스크
    fn spawn_retry_task(self: &Arc<Self>, mut retry_rx: mpsc::UnboundedReceiver<Bytes>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = retry_rx.recv().await {
                if !manager.running.load(Ordering::SeqCst) {
                    break;
                }
                // 프레임은 레인 ID만 바꿔 다음 적격 레인으로 재전송
                if let Ok((_, decoded)) = Frame::decode(&frame) {
                    if let Err(e) = manager.dispatch(decoded).await {
                        warn!("회수 프레임 재배분 실패: {}", e);
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// 모니터 통계 구독 → 프레이머 신호 공급 태스크
    fn spawn_adaptation_task(self: &Arc<Self>) {
        let manager = self.clone();
        let mut stats_rx = self.monitor.subscribe();
        let handle = tokio::spawn(async move {
            while stats_rx.changed().await.is_ok() {
                if !manager.running.load(Ordering::SeqCst) {
                    break;
                }
                let stats = stats_rx.borrow_and_update().clone();
                if let Some(rtt_ms) = stats.current_rtt_ms {
                    manager
                        .framer
                        .report_signal(rtt_ms, stats.avg_packet_loss, stats.link_class);
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// 미완 전송 버퍼 정리 태스크
    ///
    /// created_at 기준으로 타임아웃을 넘긴 재조립기/보존 청크를 제거한다
    fn spawn_eviction_task(self: &Arc<Self>) {
        let manager = self.clone();
        let timeout = Duration::from_millis(self.config.reassembly_timeout_ms.max(1));
        let tick = timeout
            .min(Duration::from_millis(1000))
            .max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                if !manager.running.load(Ordering::SeqCst) {
                    break;
                }
                manager.evict_stale(timeout);
            }
        });
        self.tasks.lock().push(handle);
    }

    /// 타임아웃 경과 전송 상태 제거
    fn evict_stale(&self, timeout: Duration) {
        let mut evicted: Vec<u64> = Vec::new();
        self.reassembly.retain(|id, reassembler| {
            if reassembler.created_at.elapsed() > timeout {
                warn!(
                    "전송 {} 타임아웃: 수신률 {:.0}% 상태로 재조립 중단",
                    id,
                    reassembler.receive_ratio() * 100.0
                );
                evicted.push(*id);
                false
            } else {
                true
            }
        });
        if !evicted.is_empty() {
            self.rerequested
                .retain(|(transfer_id, _), _| !evicted.contains(transfer_id));
        }

        self.outgoing.retain(|id, transfer| {
            if transfer.created_at.elapsed() > timeout {
                debug!("전송 {} 보존 청크 해제 (타임아웃)", id);
                false
            } else {
                true
            }
        });
    }

    /// 현재 권장 청크 크기 (프레이머 출력)
    pub fn chunk_size(&self) -> usize {
        self.framer.current_chunk_size()
    }

    /// 바이트 스트림 전송: 프레이머 크기로 분할 후 전 청크 배분
    ///
    /// 총 청크 수를 돌려준다
    pub async fn send_data(&self, transfer_id: u64, data: &[u8]) -> Result<u64> {
        let chunks = split_into_chunks(transfer_id, data, self.chunk_size());
        let total = chunks.len() as u64;
        for chunk in chunks {
            self.send_chunk(chunk).await?;
        }
        Ok(total)
    }

    /// 청크 전송
    ///
    /// 적격 레인이 생길 때까지만 대기하며, 활성 레인이 0이면
    /// 링크에 Disconnected를 요청하고 실패를 돌려준다.
    pub async fn send_chunk(&self, chunk: Chunk) -> Result<()> {
        // 재요청 대비 보존 (TransferComplete 수신 시 해제)
        self.outgoing
            .entry(chunk.header.transfer_id)
            .or_insert_with(|| OutgoingTransfer {
                chunks: HashMap::new(),
                created_at: Instant::now(),
            })
            .chunks
            .insert(chunk.header.sequence_index, chunk.clone());

        self.dispatch(Frame::Chunk(chunk)).await
    }

    /// 프레임을 적격 레인에 배분
    async fn dispatch(&self, frame: Frame) -> Result<()> {
        // 헤더의 레인 ID는 고정폭이라 인코딩 길이는 레인과 무관.
        // 워터마크 판정용 길이는 루프 밖에서 한 번만 계산한다.
        let frame_len = frame.encode(0).len();

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(Error::ConnectionClosed);
            }

            match self.pick_lane(frame_len) {
                Pick::Lane { shared, queue } => {
                    let lane_id = shared.id;
                    let encoded = Bytes::from(frame.encode(lane_id));
                    let len = encoded.len();

                    match queue.send(encoded).await {
                        Ok(()) => {
                            self.monitor.record_lane_saturation(false);
                            if matches!(frame, Frame::Chunk(_)) {
                                shared.next_send_seq.fetch_add(1, Ordering::Relaxed);
                                self.monitor.record_bytes(len as u64);
                            }
                            return Ok(());
                        }
                        Err(_) => {
                            // 워커 사망 → 예약 해제, 레인 폐쇄 후 다음 레인 재시도
                            shared.buffered.fetch_sub(len, Ordering::AcqRel);
                            shared.close();
                            debug!("레인 {} 큐 닫힘, 회전 계속", lane_id);
                            continue;
                        }
                    }
                }
                Pick::AllSaturated => {
                    // 전 레인 포화: 하한 배수 신호까지 대기
                    // (알림 유실 대비 주기 재검사)
                    self.monitor.record_lane_saturation(true);
                    let _ = tokio::time::timeout(
                        Duration::from_millis(50),
                        self.drained.notified(),
                    )
                    .await;
                }
                Pick::NoneOpen => {
                    warn!("활성 레인 0 → 링크 Disconnected 요청");
                    self.link.request_disconnected();
                    return Err(Error::AllLanesClosed);
                }
            }
        }
    }

    /// 라운드로빈 레인 선택 + 적체 바이트 예약
    ///
    /// 적격 조건: Open + 래치 해제 + (적체 + 프레임) ≤ 상한 워터마크.
    /// 적격성 검사와 적체 가산을 fetch_update 한 번으로 묶어,
    /// 동시 배분 경합에서도 상한 워터마크를 넘지 않는다.
    fn pick_lane(&self, frame_len: usize) -> Pick {
        let lanes = self.lanes.read();
        let count = lanes.len();
        if count == 0 {
            return Pick::NoneOpen;
        }

        let start = self.rr_cursor.load(Ordering::Relaxed);
        let mut any_open = false;

        for offset in 0..count {
            let index = (start + offset) % count;
            let entry = &lanes[index];
            let shared = &entry.shared;

            if !shared.is_open() {
                continue;
            }
            any_open = true;

            if shared.paused.load(Ordering::Acquire) {
                if shared.buffered.load(Ordering::Acquire) < self.config.low_watermark {
                    shared.paused.store(false, Ordering::Release);
                } else {
                    continue;
                }
            }

            let reserved = shared
                .buffered
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    (current + frame_len <= self.config.high_watermark)
                        .then_some(current + frame_len)
                });

            match reserved {
                Ok(_) => {
                    // 선택 지점 다음부터 순환 재개
                    self.rr_cursor.store(index + 1, Ordering::Relaxed);
                    return Pick::Lane {
                        shared: shared.clone(),
                        queue: entry.queue.clone(),
                    };
                }
                Err(_) => {
                    // 상한 도달 → 래치 설정, 하한 배수까지 제외
                    shared.paused.store(true, Ordering::Release);
                    continue;
                }
            }
        }

        if any_open {
            Pick::AllSaturated
        } else {
            Pick::NoneOpen
        }
    }

    /// 수신 프레임 처리 루프 기동
    ///
    /// `frames_rx`는 전송 기질의 수신 펌프가 공급한다
    pub fn start_receiver(self: &Arc<Self>, mut frames_rx: mpsc::Receiver<Bytes>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(raw) = frames_rx.recv().await {
                if !manager.running.load(Ordering::SeqCst) {
                    break;
                }
                match Frame::decode(&raw) {
                    Ok((lane_id, frame)) => manager.handle_frame(lane_id, frame).await,
                    Err(e) => {
                        warn!("프레임 디코드 실패: {}", e);
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// 레인 RTT 프로브 루프 기동
    pub fn start_probe_loop(self: &Arc<Self>) {
        let manager = self.clone();
        let interval = Duration::from_millis(self.config.lane_probe_interval_ms);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !manager.running.load(Ordering::SeqCst) {
                    break;
                }
                let probe = Frame::Probe(ProbeMessage::new(rand::random()));
                if let Err(e) = manager.dispatch(probe).await {
                    debug!("프로브 전송 실패: {}", e);
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// 수신 프레임 1건 처리
    async fn handle_frame(&self, lane_id: u8, frame: Frame) {
        match frame {
            Frame::Chunk(chunk) => self.handle_chunk(lane_id, chunk).await,

            Frame::Rerequest(msg) => self.handle_rerequest(msg).await,

            Frame::TransferComplete(msg) => {
                debug!(
                    "전송 {} 완료 확인 ({}ms), 보존 청크 해제",
                    msg.transfer_id, msg.elapsed_ms
                );
                self.outgoing.remove(&msg.transfer_id);
            }

            Frame::Probe(msg) => {
                // 동일 토큰/타임스탬프를 그대로 반향
                if let Err(e) = self.dispatch(Frame::Echo(msg)).await {
                    debug!("에코 응답 실패: {}", e);
                }
            }

            Frame::Echo(msg) => {
                let now_us = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_micros() as u64;
                if now_us > msg.timestamp_us {
                    let rtt_ms = (now_us - msg.timestamp_us) as f64 / 1000.0;
                    self.monitor.record_rtt_sample(rtt_ms);
                }
            }
        }
    }

    /// 수신 청크 → 재조립
    async fn handle_chunk(&self, lane_id: u8, chunk: Chunk) {
        let transfer_id = chunk.header.transfer_id;
        let total_count = chunk.header.total_count;
        let chunk_len = chunk.payload.len();

        {
            let lanes = self.lanes.read();
            if let Some(entry) = lanes.iter().find(|l| l.shared.id == lane_id) {
                entry.shared.next_recv_seq.fetch_add(1, Ordering::Relaxed);
            }
        }

        let outcome = {
            let mut reassembler = self
                .reassembly
                .entry(transfer_id)
                .or_insert_with(|| Reassembler::new(transfer_id, total_count));
            reassembler.insert(&chunk)
        };

        match outcome {
            InsertOutcome::Inserted => {
                self.monitor.record_bytes(chunk_len as u64);
                self.try_finish_transfer(transfer_id).await;
            }

            InsertOutcome::DigestMismatch => {
                let key = (transfer_id, chunk.header.sequence_index);
                if self.rerequested.insert(key, ()).is_none() {
                    // 해당 인덱스만 1회 재요청
                    warn!(
                        "무결성 불일치: transfer={}, index={} → 단건 재요청",
                        transfer_id, chunk.header.sequence_index
                    );
                    let msg = RerequestMessage {
                        transfer_id,
                        sequence_index: chunk.header.sequence_index,
                    };
                    if let Err(e) = self.dispatch(Frame::Rerequest(msg)).await {
                        warn!("재요청 전송 실패: {}", e);
                    }
                } else {
                    // 재요청본도 불일치 → 손상 이벤트로 표면화
                    let err = Error::IntegrityMismatch {
                        transfer_id,
                        sequence_index: chunk.header.sequence_index,
                    };
                    warn!("재요청본 검증 실패: {}", err);
                    let _ = self
                        .events_tx
                        .send(TransferEvent::Corrupt {
                            transfer_id,
                            sequence_index: chunk.header.sequence_index,
                        })
                        .await;
                }
            }

            InsertOutcome::Duplicate | InsertOutcome::OutOfRange => {}
        }
    }

    /// 전송 완료 검사 + 이벤트 발행
    async fn try_finish_transfer(&self, transfer_id: u64) {
        let complete = self
            .reassembly
            .get(&transfer_id)
            .map(|r| r.is_complete())
            .unwrap_or(false);
        if !complete {
            return;
        }

        if let Some((_, reassembler)) = self.reassembly.remove(&transfer_id) {
            self.rerequested.retain(|(id, _), _| *id != transfer_id);
            let total_count = reassembler.total_count;
            let elapsed_ms = reassembler.created_at.elapsed().as_millis() as u64;

            if let Some(data) = reassembler.into_data() {
                info!(
                    "전송 {} 재조립 완료: {} bytes, {} 청크, {}ms",
                    transfer_id,
                    data.len(),
                    total_count,
                    elapsed_ms
                );

                let complete_msg = TransferCompleteMessage {
                    transfer_id,
                    total_count,
                    elapsed_ms,
                };
                if let Err(e) = self.dispatch(Frame::TransferComplete(complete_msg)).await {
                    debug!("완료 알림 전송 실패: {}", e);
                }

                let _ = self
                    .events_tx
                    .send(TransferEvent::Completed { transfer_id, data })
                    .await;
            }
        }
    }

    /// 단건 재요청 응답: 보존 청크 재전송
    async fn handle_rerequest(&self, msg: RerequestMessage) {
        let chunk = self
            .outgoing
            .get(&msg.transfer_id)
            .and_then(|t| t.chunks.get(&msg.sequence_index).cloned());

        match chunk {
            Some(chunk) => {
                debug!(
                    "재요청 응답: transfer={}, index={}",
                    msg.transfer_id, msg.sequence_index
                );
                if let Err(e) = self.dispatch(Frame::Chunk(chunk)).await {
                    warn!("재요청 응답 전송 실패: {}", e);
                }
            }
            None => {
                warn!(
                    "재요청 대상 없음: transfer={}, index={}",
                    msg.transfer_id, msg.sequence_index
                );
            }
        }
    }

    /// 열린 레인 수
    pub fn open_lane_count(&self) -> usize {
        self.lanes.read().iter().filter(|l| l.shared.is_open()).count()
    }

    /// 레인별 (ID, 역할, 상태, 적체 바이트) 스냅샷
    pub fn lane_snapshot(&self) -> Vec<(u8, LaneRole, LaneState, usize)> {
        self.lanes
            .read()
            .iter()
            .map(|l| {
                (
                    l.shared.id,
                    l.shared.role,
                    l.shared.state(),
                    l.shared.buffered.load(Ordering::Acquire),
                )
            })
            .collect()
    }

    /// 종료: 모든 레인 폐쇄, 태스크 중단, 버퍼 해제
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("레인 관리자 종료");

        {
            let mut lanes = self.lanes.write();
            for lane in lanes.iter() {
                lane.shared.close();
            }
            // 큐 송신단 제거로 워커 자연 종료
            lanes.clear();
        }

        self.outgoing.clear();
        self.reassembly.clear();
        self.rerequested.clear();
        self.drained.notify_waiters();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::split_into_chunks;
    use std::collections::HashSet;

    /// 인메모리 전송 기질
    struct TestTransport {
        sent: Mutex<Vec<(u8, Bytes)>>,
        failing: Mutex<HashSet<u8>>,
    }

    impl TestTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                failing: Mutex::new(HashSet::new()),
            })
        }

        fn fail_lane(&self, lane_id: u8) {
            self.failing.lock().insert(lane_id);
        }

        fn sent_lane_ids(&self) -> Vec<u8> {
            self.sent.lock().iter().map(|(id, _)| *id).collect()
        }

        fn sent_chunk_count(&self) -> usize {
            self.sent
                .lock()
                .iter()
                .filter(|(_, raw)| matches!(Frame::decode(raw), Ok((_, Frame::Chunk(_)))))
                .count()
        }
    }

    impl LaneTransport for TestTransport {
        fn send(&self, lane_id: u8, frame: Bytes) -> impl Future<Output = Result<()>> + Send {
            let failing = self.failing.lock().contains(&lane_id);
            if !failing {
                self.sent.lock().push((lane_id, frame));
            }
            async move {
                if failing {
                    Err(Error::LaneClosed { lane_id })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// RUST_LOG 필터를 존중하는 테스트 로거 (중복 초기화 무해)
    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn connected_link() -> Arc<LinkHandle> {
        let link = Arc::new(LinkHandle::new());
        link.set_state(LinkState::Connected);
        link
    }

    fn manager_with(
        config: EngineConfig,
        transport: Arc<TestTransport>,
    ) -> (Arc<LaneManager<TestTransport>>, mpsc::Receiver<TransferEvent>) {
        init_logging();
        let link = connected_link();
        let monitor = Arc::new(TransferMonitor::new(config.clone()));
        LaneManager::new(config, transport, link, monitor).unwrap()
    }

    #[tokio::test]
    async fn test_requires_connected_link() {
        let link = Arc::new(LinkHandle::new());
        let config = EngineConfig::default();
        let monitor = Arc::new(TransferMonitor::new(config.clone()));
        let result = LaneManager::new(config, TestTransport::new(), link, monitor);
        assert!(matches!(result, Err(Error::LinkNotConnected { .. })));
    }

    #[tokio::test]
    async fn test_round_robin_across_open_lanes() {
        let transport = TestTransport::new();
        let (manager, _events) = manager_with(EngineConfig::default(), transport.clone());

        for chunk in split_into_chunks(1, &vec![7u8; 600], 100) {
            manager.send_chunk(chunk).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ids = transport.sent_lane_ids();
        let used: HashSet<u8> = ids.iter().copied().collect();
        assert_eq!(used, HashSet::from([0, 1, 2]));
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_saturated_lane_skipped_for_rotation() {
        // 레인 1이 17MiB 적체 → 이후 청크는 레인 0/2로만 배분
        let transport = TestTransport::new();
        let (manager, _events) = manager_with(EngineConfig::default(), transport.clone());

        {
            let lanes = manager.lanes.read();
            lanes[1]
                .shared
                .buffered
                .store(17 * 1024 * 1024, Ordering::Release);
        }

        for chunk in split_into_chunks(2, &vec![1u8; 1000], 100) {
            manager.send_chunk(chunk).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ids = transport.sent_lane_ids();
        assert_eq!(ids.len(), 10);
        assert!(ids.iter().all(|&id| id != 1), "포화 레인으로 배분됨: {:?}", ids);
        assert!(ids.contains(&0) && ids.contains(&2));

        // 상한 래치 확인
        let snapshot = manager.lane_snapshot();
        assert_eq!(snapshot[1].3, 17 * 1024 * 1024);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_backpressure_invariant_on_selected_lane() {
        // 의도적으로 선택된 레인은 send 직후에도 상한 워터마크를 넘지 않음
        let transport = TestTransport::new();
        let mut config = EngineConfig::default();
        config.lane_count = 2;
        let (manager, _events) = manager_with(config.clone(), transport.clone());

        for chunk in split_into_chunks(3, &vec![9u8; 4000], 500) {
            manager.send_chunk(chunk).await.unwrap();
            for (_, _, _, buffered) in manager.lane_snapshot() {
                assert!(buffered <= config.high_watermark);
            }
        }
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_single_lane_failure_recovers_without_error() {
        // 레인 1개 실패 + 레인 2개 이상 구성 → 호출자 가시 에러 없이 완료
        let transport = TestTransport::new();
        transport.fail_lane(0);
        let (manager, _events) = manager_with(EngineConfig::default(), transport.clone());

        let chunks = split_into_chunks(5, &vec![3u8; 900], 100);
        for chunk in chunks {
            manager.send_chunk(chunk).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 실패 레인은 폐쇄되고 청크 9건 전부 다른 레인으로 전달
        assert_eq!(transport.sent_chunk_count(), 9);
        assert!(transport.sent_lane_ids().iter().all(|&id| id != 0));
        assert_eq!(manager.open_lane_count(), 2);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_all_lanes_closed_requests_disconnect() {
        let transport = TestTransport::new();
        transport.fail_lane(0);
        let mut config = EngineConfig::default();
        config.lane_count = 1;
        let link = connected_link();
        let monitor = Arc::new(TransferMonitor::new(config.clone()));
        let (manager, _events) =
            LaneManager::new(config, transport.clone(), link.clone(), monitor).unwrap();

        let chunks = split_into_chunks(6, &vec![1u8; 200], 100);
        // 워커가 실패를 관측해 레인을 폐쇄할 때까지 전송 반복
        let mut saw_error = false;
        for _ in 0..20 {
            for chunk in chunks.clone() {
                if manager.send_chunk(chunk).await.is_err() {
                    saw_error = true;
                    break;
                }
            }
            if saw_error {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(saw_error);
        assert_eq!(link.state(), LinkState::Disconnected);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_receive_side_reassembly_and_complete_event() {
        let transport = TestTransport::new();
        let (manager, mut events) = manager_with(EngineConfig::default(), transport.clone());

        let (frames_tx, frames_rx) = mpsc::channel(64);
        manager.start_receiver(frames_rx);

        let data: Vec<u8> = (0..200u8).collect();
        let chunks = split_into_chunks(7, &data, 50);
        // 레인/순서 무관 도착 시뮬레이션: 역순 + 임의 레인 ID
        for (i, chunk) in chunks.iter().rev().enumerate() {
            let raw = Bytes::from(Frame::Chunk(chunk.clone()).encode((i % 3) as u8));
            frames_tx.send(raw).await.unwrap();
        }

        match tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            TransferEvent::Completed { transfer_id, data: received } => {
                assert_eq!(transfer_id, 7);
                assert_eq!(received.as_ref(), &data[..]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_digest_failure_triggers_single_rerequest() {
        // 인덱스 7 손상 → 재요청 프레임은 해당 인덱스 1건만
        let transport = TestTransport::new();
        let (manager, mut events) = manager_with(EngineConfig::default(), transport.clone());

        let (frames_tx, frames_rx) = mpsc::channel(64);
        manager.start_receiver(frames_rx);

        let data: Vec<u8> = (0..100u8).collect();
        let chunks = split_into_chunks(8, &data, 10);
        for (i, chunk) in chunks.iter().enumerate() {
            let mut delivered = chunk.clone();
            if i == 7 {
                delivered.payload = Bytes::from(vec![0xAA; delivered.payload.len()]);
            }
            frames_tx
                .send(Bytes::from(Frame::Chunk(delivered).encode(0)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 재요청은 인덱스 7 단건
        let rerequests: Vec<RerequestMessage> = transport
            .sent
            .lock()
            .iter()
            .filter_map(|(_, raw)| match Frame::decode(raw) {
                Ok((_, Frame::Rerequest(msg))) => Some(msg),
                _ => None,
            })
            .collect();
        assert_eq!(rerequests.len(), 1);
        assert_eq!(rerequests[0].sequence_index, 7);

        // 유효 사본 도착 → 완료
        frames_tx
            .send(Bytes::from(Frame::Chunk(chunks[7].clone()).encode(2)))
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            TransferEvent::Completed { data: received, .. } => {
                assert_eq!(received.as_ref(), &data[..]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_second_digest_failure_surfaces_corrupt_event() {
        let transport = TestTransport::new();
        let (manager, mut events) = manager_with(EngineConfig::default(), transport.clone());

        let (frames_tx, frames_rx) = mpsc::channel(64);
        manager.start_receiver(frames_rx);

        let chunks = split_into_chunks(9, &[1, 2, 3, 4], 2);
        let mut corrupted = chunks[1].clone();
        corrupted.payload = Bytes::from_static(b"xx");

        // 1차 손상 → 재요청, 2차 손상 → Corrupt 이벤트
        for _ in 0..2 {
            frames_tx
                .send(Bytes::from(Frame::Chunk(corrupted.clone()).encode(0)))
                .await
                .unwrap();
        }

        match tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            TransferEvent::Corrupt {
                transfer_id,
                sequence_index,
            } => {
                assert_eq!(transfer_id, 9);
                assert_eq!(sequence_index, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_rerequest_served_from_retained_chunks() {
        let transport = TestTransport::new();
        let (manager, _events) = manager_with(EngineConfig::default(), transport.clone());

        let (frames_tx, frames_rx) = mpsc::channel(64);
        manager.start_receiver(frames_rx);

        let chunks = split_into_chunks(10, &[9u8; 300], 100);
        for chunk in chunks {
            manager.send_chunk(chunk).await.unwrap();
        }
        // 워커 큐 배수 대기
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = transport.sent_chunk_count();

        // 상대의 단건 재요청 수신 → 보존 청크 재전송
        let msg = RerequestMessage {
            transfer_id: 10,
            sequence_index: 1,
        };
        frames_tx
            .send(Bytes::from(Frame::Rerequest(msg).encode(0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.sent_chunk_count(), before + 1);
        manager.shutdown();
    }

    /// 송신이 완료되지 않는 전송 기질 (적체 유지용)
    struct StallTransport;

    impl LaneTransport for StallTransport {
        fn send(&self, _lane_id: u8, _frame: Bytes) -> impl Future<Output = Result<()>> + Send {
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_exceed_high_watermark() {
        // 동시 배분 경합에서도 레인 적체가 상한 워터마크를 넘지 않음
        init_logging();
        let mut config = EngineConfig::default();
        config.lane_count = 1;
        config.high_watermark = 2000;
        config.low_watermark = 500;

        let link = connected_link();
        let monitor = Arc::new(TransferMonitor::new(config.clone()));
        let (manager, _events) =
            LaneManager::new(config, Arc::new(StallTransport), link, monitor).unwrap();

        for i in 0..8u64 {
            let sender = manager.clone();
            tokio::spawn(async move {
                let chunk = Chunk::new(20, i, 8, Bytes::from(vec![0u8; 600]));
                let _ = sender.send_chunk(chunk).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = manager.lane_snapshot();
        assert!(snapshot[0].3 <= 2000, "적체 {} 바이트가 상한 초과", snapshot[0].3);
        assert!(snapshot[0].3 > 0);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_stale_incomplete_transfer_evicted() {
        let transport = TestTransport::new();
        let mut config = EngineConfig::default();
        config.reassembly_timeout_ms = 50;
        let (manager, _events) = manager_with(config, transport.clone());

        let (frames_tx, frames_rx) = mpsc::channel(8);
        manager.start_receiver(frames_rx);

        // 3청크 중 1건만 도착한 미완 전송
        let chunks = split_into_chunks(21, &[5u8; 300], 100);
        frames_tx
            .send(Bytes::from(Frame::Chunk(chunks[0].clone()).encode(0)))
            .await
            .unwrap();

        // 송신측 보존 청크도 같은 타임아웃 대상
        manager
            .send_chunk(Chunk::new(22, 0, 2, Bytes::from_static(b"hold")))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.reassembly.len(), 1);
        assert_eq!(manager.outgoing.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.reassembly.is_empty());
        assert!(manager.outgoing.is_empty());
        assert!(manager.rerequested.is_empty());
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_framer_follows_monitor_signals() {
        let transport = TestTransport::new();
        let (manager, _events) = manager_with(EngineConfig::default(), transport);
        assert_eq!(manager.chunk_size(), 64 * 1024);

        // 저지연 무손실 신호 → 평가마다 한 버킷씩 256KiB로 수렴
        for _ in 0..6 {
            manager.monitor.record_rtt_sample(2.0);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.chunk_size(), 256 * 1024);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_send_data_uses_framer_chunk_size() {
        let transport = TestTransport::new();
        let (manager, _events) = manager_with(EngineConfig::default(), transport.clone());

        // 시작 버킷 64KiB → 200000바이트는 4청크
        let total = manager.send_data(23, &vec![7u8; 200_000]).await.unwrap();
        assert_eq!(total, 4);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent_chunk_count(), 4);
        manager.shutdown();
    }
}
