//! 링크 수립기
//!
//! 분류 결과 → 전략 → 후보 교환 → 연결성 검사 → (필요 시) 릴레이 캐스케이드.
//! 실패는 단계별 타입 에러로 구분되어 호출자가 진행 상황을 알 수 있다.
//!
//! 연결성 검사는 세션 소켓 하나로 모든 원격 후보에 프로브를 살포하고
//! 첫 유효 에코를 승자로 삼는다. 검사 중 수신한 상대 프로브에는 즉시
//! 에코로 응답한다 (양방향 홀펀칭 겸용).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::candidate::{self, Candidate, CandidateKind, PRIORITY_PEER_REFLEXIVE};
use crate::config::{EngineConfig, DEFAULT_PROBE_SERVERS};
use crate::lane::LaneTransport;
use crate::signaling::{SignalingEvent, SignalingPort};
use crate::strategy::{self, ConnectionStrategy, StrategyMode};
use crate::nat::NatClass;
use crate::wire::{Frame, ProbeMessage};
use crate::{Error, Result};

/// 링크 상태 기계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// 시작 전
    Idle,

    /// NAT 분류 중
    Probing,

    /// 후보 교환 중
    Negotiating,

    /// 연결성 검사 / 릴레이 캐스케이드 중
    Connecting,

    /// 수립 완료
    Connected,

    /// 연결 유실 (재시도 대상)
    Disconnected,

    /// 재시도 소진
    Failed,

    /// 정상 종료
    Closed,
}

impl LinkState {
    /// 상태 이름 (로그/에러용)
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Idle => "Idle",
            LinkState::Probing => "Probing",
            LinkState::Negotiating => "Negotiating",
            LinkState::Connecting => "Connecting",
            LinkState::Connected => "Connected",
            LinkState::Disconnected => "Disconnected",
            LinkState::Failed => "Failed",
            LinkState::Closed => "Closed",
        }
    }
}

/// 링크 상태 공유 핸들
///
/// 레인 관리자 등 하위 협력자가 링크 상태를 조회하고, 활성 레인이
/// 전멸했을 때 Disconnected 재진입을 요청하는 통로
pub struct LinkHandle {
    state: RwLock<LinkState>,
    reconnect: Notify,
}

impl LinkHandle {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LinkState::Idle),
            reconnect: Notify::new(),
        }
    }

    /// 현재 상태
    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// 상태 전이
    pub fn set_state(&self, next: LinkState) {
        let mut state = self.state.write();
        if *state != next {
            debug!("링크 상태 전이: {} -> {}", state.name(), next.name());
            *state = next;
        }
    }

    /// 연결 유실 보고 (하위 협력자 → 수립기)
    pub fn request_disconnected(&self) {
        self.set_state(LinkState::Disconnected);
        self.reconnect.notify_waiters();
    }

    /// Disconnected 요청 대기
    pub async fn wait_disconnect_request(&self) {
        self.reconnect.notified().await;
    }
}

impl Default for LinkHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// 릴레이 폴백 단계 (시도 순서대로)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// 릴레이 경유 UDP
    RelayedUdp,

    /// 릴레이 경유 스트림
    RelayedStream,

    /// 443 포트 TLS 터널 (최후 수단)
    RelayedTls443,
}

/// 수립된 링크의 전송 형태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// 직결 UDP
    DirectUdp,

    /// 릴레이 경유
    Relayed(RelayMode),
}

/// 수립 시도 1회의 기록
#[derive(Debug)]
pub struct LinkSession {
    /// 선택된 전략
    pub strategy: ConnectionStrategy,

    /// 교환한 로컬 후보
    pub local_candidates: Vec<Candidate>,

    /// 수신한 원격 후보 (우선순위 내림차순)
    pub remote_candidates: Vec<Candidate>,

    /// 시도 번호 (1부터)
    pub attempt: u32,
}

/// 링크 IO (전송 형태별)
pub enum LinkIo {
    /// UDP 소켓 (직결 또는 릴레이 UDP)
    Udp(Arc<UdpSocket>),

    /// 스트림 (릴레이 스트림 / TLS 443)
    Stream(TcpStream),
}

/// 수립 완료된 링크
pub struct EstablishedLink {
    /// 전송 형태
    pub mode: TransportMode,

    /// 승자 원격 주소
    pub remote_addr: SocketAddr,

    /// 검사에서 관측한 RTT (밀리초)
    pub rtt_ms: f64,

    /// 수립 소요 시간
    pub elapsed: Duration,

    /// 세션 기록
    pub session: LinkSession,

    io: LinkIo,
}

impl EstablishedLink {
    /// UDP 기반 링크면 레인 전송 기질 생성
    pub fn lane_transport(&self) -> Option<UdpLaneTransport> {
        match &self.io {
            LinkIo::Udp(socket) => Some(UdpLaneTransport {
                socket: socket.clone(),
                remote: self.remote_addr,
            }),
            LinkIo::Stream(_) => None,
        }
    }

    /// 스트림 기반 링크면 스트림 추출
    pub fn into_stream(self) -> Option<TcpStream> {
        match self.io {
            LinkIo::Udp(_) => None,
            LinkIo::Stream(stream) => Some(stream),
        }
    }
}

/// UDP 레인 전송 기질
///
/// 레인들은 같은 소켓을 공유한다. 레인 구분은 프레임 헤더의 lane_id로 한다.
pub struct UdpLaneTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl UdpLaneTransport {
    /// 수신 펌프 기동: 승자 원격 주소의 데이터그램만 프레임 채널로 공급
    pub fn spawn_recv_pump(&self, capacity: usize) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(capacity);
        let socket = self.socket.clone();
        let remote = self.remote;

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        if from != remote {
                            continue;
                        }
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("수신 펌프 종료: {}", e);
                        break;
                    }
                }
            }
        });
        rx
    }
}

impl LaneTransport for UdpLaneTransport {
    fn send(
        &self,
        _lane_id: u8,
        frame: Bytes,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        let socket = self.socket.clone();
        let remote = self.remote;
        async move {
            socket.send_to(&frame, remote).await?;
            Ok(())
        }
    }
}

/// 링크 수립기
pub struct LinkEstablisher {
    config: EngineConfig,
    handle: Arc<LinkHandle>,
    signaling: SignalingPort,
}

impl LinkEstablisher {
    pub fn new(config: EngineConfig, signaling: SignalingPort) -> Self {
        Self {
            config,
            handle: Arc::new(LinkHandle::new()),
            signaling,
        }
    }

    /// 상태 공유 핸들
    pub fn handle(&self) -> Arc<LinkHandle> {
        self.handle.clone()
    }

    /// 링크 수립 (재시도 포함)
    ///
    /// 시도 실패 시 Disconnected로 전이 후 선형 백오프를 두고 재시도하며,
    /// `max_link_retries` 소진 시 Failed로 전이하고 [`Error::RetriesExhausted`]
    pub async fn connect(
        &mut self,
        local_class: NatClass,
        remote_class: NatClass,
    ) -> Result<EstablishedLink> {
        let mut attempt = 1u32;
        loop {
            match self.establish_once(local_class, remote_class, attempt).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    warn!("링크 수립 시도 {} 실패: {}", attempt, e);
                    if attempt >= self.config.max_link_retries {
                        self.handle.set_state(LinkState::Failed);
                        return Err(Error::RetriesExhausted { attempts: attempt });
                    }
                    self.handle.set_state(LinkState::Disconnected);
                    tokio::time::sleep(self.config.retry_backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// 수립 시도 1회
    ///
    /// 전략은 매 시도마다 새로 계산한다 (분류가 갱신될 수 있음)
    pub async fn establish_once(
        &mut self,
        local_class: NatClass,
        remote_class: NatClass,
        attempt: u32,
    ) -> Result<EstablishedLink> {
        let started = Instant::now();

        self.handle.set_state(LinkState::Probing);
        let strategy = strategy::select(local_class, remote_class);
        info!(
            "전략 선택: {:?}, direct_timeout={}ms ({})",
            strategy.mode, strategy.direct_attempt_timeout_ms, strategy.reason
        );

        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);

        self.handle.set_state(LinkState::Negotiating);
        let mut session = self.exchange_candidates(&socket, &strategy, attempt).await?;

        self.handle.set_state(LinkState::Connecting);
        let result = self.run_checks(&socket, &strategy, &mut session).await;

        match result {
            Ok(link) => {
                self.handle.set_state(LinkState::Connected);
                info!(
                    "링크 수립: {:?}, remote={}, rtt={:.1}ms, {}ms 소요",
                    link.mode,
                    link.remote_addr,
                    link.rtt_ms,
                    started.elapsed().as_millis()
                );
                Ok(EstablishedLink {
                    elapsed: started.elapsed(),
                    ..link
                })
            }
            Err(e) => Err(e),
        }
    }

    /// 정상 종료
    pub fn close(&self) {
        self.handle.set_state(LinkState::Closed);
    }

    /// 후보 수집 + 시그널링 교환
    ///
    /// 로컬 후보는 수집 즉시 하나씩 내보낸다 (일괄 대기 없음).
    /// 원격 후보는 상대의 후보 종료 표지 또는 시그널링 타임아웃까지
    /// 수집한다. 불투명 협상 메시지는 수집에 영향을 주지 않는다.
    async fn exchange_candidates(
        &mut self,
        socket: &UdpSocket,
        strategy: &ConnectionStrategy,
        attempt: u32,
    ) -> Result<LinkSession> {
        let mut local_candidates = Vec::new();
        let local_port = socket.local_addr()?.port();

        if let Some(host) = candidate::host_candidate(local_port) {
            self.signaling.send_candidate(host).await?;
            local_candidates.push(host);
        }

        // RelayOnly면 반사 후보는 불필요 (직결 시도 자체가 없음).
        // 프로브 윈도우 0은 반사 수집 자체를 끈다.
        if strategy.mode != StrategyMode::RelayOnly && self.config.probe_window_ms > 0 {
            let window = Duration::from_millis(self.config.probe_window_ms);
            for server in DEFAULT_PROBE_SERVERS {
                let Ok(mut addrs) = tokio::net::lookup_host(server).await else {
                    continue;
                };
                let Some(addr) = addrs.next() else { continue };

                if let Some(reflexive) =
                    candidate::server_reflexive_candidate(socket, addr, window).await
                {
                    self.signaling.send_candidate(reflexive).await?;
                    local_candidates.push(reflexive);
                    break;
                }
            }
        }

        for relay_addr in &self.config.relay_servers {
            let relay = Candidate::relay(*relay_addr, strategy.prefer_relay_candidates);
            self.signaling.send_candidate(relay).await?;
            local_candidates.push(relay);
        }

        // 후보 종료 표지
        self.signaling.send_end_of_candidates().await?;

        let mut remote_candidates = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(self.config.signaling_timeout_ms);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.signaling.inbound.recv()).await {
                Ok(Some(SignalingEvent::Candidate(c))) => {
                    debug!("원격 후보 수신: {:?} {}", c.kind, c.addr);
                    remote_candidates.push(c);
                }
                Ok(Some(SignalingEvent::EndOfCandidates)) => break,
                Ok(Some(SignalingEvent::Negotiation(payload))) => {
                    // 협상 메시지는 후보 수집과 무관한 불투명 바이트
                    debug!("후보 교환 중 협상 메시지 수신 ({} bytes), 계속 수집", payload.len());
                }
                Ok(None) => return Err(Error::ChannelClosed),
                Err(_) => {
                    if remote_candidates.is_empty() {
                        return Err(Error::SignalingTimeout);
                    }
                    break;
                }
            }
        }

        candidate::sort_by_priority(&mut remote_candidates);

        Ok(LinkSession {
            strategy: *strategy,
            local_candidates,
            remote_candidates,
            attempt,
        })
    }

    /// 전략 모드별 검사 실행
    async fn run_checks(
        &self,
        socket: &Arc<UdpSocket>,
        strategy: &ConnectionStrategy,
        session: &mut LinkSession,
    ) -> Result<EstablishedLink> {
        let direct: Vec<Candidate> = session
            .remote_candidates
            .iter()
            .filter(|c| c.kind != CandidateKind::Relay)
            .copied()
            .collect();
        let relays: Vec<Candidate> = session
            .remote_candidates
            .iter()
            .filter(|c| c.kind == CandidateKind::Relay)
            .copied()
            .collect();

        match strategy.mode {
            StrategyMode::Direct => {
                let (winner, rtt_ms) = self
                    .direct_check(socket, &direct, strategy.direct_attempt_timeout_ms)
                    .await?;
                self.note_peer_reflexive(session, winner);
                Ok(self.direct_link(socket, session, winner, rtt_ms))
            }

            StrategyMode::RelayFallback => {
                match self
                    .direct_check(socket, &direct, strategy.direct_attempt_timeout_ms)
                    .await
                {
                    Ok((winner, rtt_ms)) => {
                        self.note_peer_reflexive(session, winner);
                        Ok(self.direct_link(socket, session, winner, rtt_ms))
                    }
                    Err(e) => {
                        info!("직결 실패({}), 릴레이 캐스케이드 진입", e);
                        self.relay_cascade(socket, &relays, session).await
                    }
                }
            }

            StrategyMode::RelayOnly => self.relay_cascade(socket, &relays, session).await,
        }
    }

    fn direct_link(
        &self,
        socket: &Arc<UdpSocket>,
        session: &mut LinkSession,
        winner: Candidate,
        rtt_ms: f64,
    ) -> EstablishedLink {
        EstablishedLink {
            mode: TransportMode::DirectUdp,
            remote_addr: winner.addr,
            rtt_ms,
            elapsed: Duration::ZERO,
            session: LinkSession {
                strategy: session.strategy,
                local_candidates: std::mem::take(&mut session.local_candidates),
                remote_candidates: std::mem::take(&mut session.remote_candidates),
                attempt: session.attempt,
            },
            io: LinkIo::Udp(socket.clone()),
        }
    }

    /// 승자 주소가 교환된 후보 밖이면 PeerReflexive로 기록
    fn note_peer_reflexive(&self, session: &mut LinkSession, winner: Candidate) {
        if winner.kind == CandidateKind::PeerReflexive {
            debug!("동료 반사 후보 발견: {}", winner.addr);
            session.remote_candidates.push(winner);
        }
    }

    /// 직결 연결성 검사
    ///
    /// 세션 소켓 하나로 모든 후보에 500ms 주기로 프로브를 보내고
    /// 첫 유효 에코를 승자로 반환한다. 상대 프로브에는 에코로 응답한다.
    async fn direct_check(
        &self,
        socket: &UdpSocket,
        candidates: &[Candidate],
        timeout_ms: u64,
    ) -> Result<(Candidate, f64)> {
        if candidates.is_empty() {
            return Err(Error::NoDirectPath);
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut probe_tick = tokio::time::interval(Duration::from_millis(500));
        let mut outstanding: HashMap<u64, (Candidate, Instant)> = HashMap::new();
        let mut buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                _ = probe_tick.tick() => {
                    for c in candidates {
                        let token: u64 = rand::random();
                        let frame = Frame::Probe(ProbeMessage::new(token)).encode(0);
                        outstanding.insert(token, (*c, Instant::now()));
                        if let Err(e) = socket.send_to(&frame, c.addr).await {
                            debug!("프로브 전송 실패: {} -> {}", c.addr, e);
                        }
                    }
                }

                recv = socket.recv_from(&mut buf) => {
                    let (n, from) = recv?;
                    let Ok((_, frame)) = Frame::decode(&buf[..n]) else {
                        continue;
                    };
                    match frame {
                        Frame::Probe(msg) => {
                            // 상대의 검사 프로브 → 즉시 에코 (홀펀칭 겸용)
                            let echo = Frame::Echo(msg).encode(0);
                            let _ = socket.send_to(&echo, from).await;
                        }
                        Frame::Echo(msg) => {
                            if let Some((cand, sent_at)) = outstanding.remove(&msg.token) {
                                let rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
                                let winner = if from == cand.addr {
                                    cand
                                } else {
                                    // 교환 후보 밖 주소에서 응답 → 동료 반사
                                    Candidate::new(
                                        CandidateKind::PeerReflexive,
                                        from,
                                        PRIORITY_PEER_REFLEXIVE,
                                    )
                                };
                                return Ok((winner, rtt_ms));
                            }
                        }
                        _ => {}
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::NoDirectPath);
                }
            }
        }
    }

    /// 릴레이 폴백 캐스케이드
    ///
    /// 릴레이 후보마다 RelayedUdp → RelayedStream → RelayedTls443 순서로,
    /// 단계별 타임아웃 안에 도달성을 확인한다
    async fn relay_cascade(
        &self,
        socket: &Arc<UdpSocket>,
        relays: &[Candidate],
        session: &mut LinkSession,
    ) -> Result<EstablishedLink> {
        if relays.is_empty() {
            return Err(Error::RelayUnreachable);
        }

        let stage_timeout = self.config.relay_stage_timeout_ms;

        for relay in relays {
            // 1단계: 릴레이 경유 UDP
            match self.direct_check(socket, &[*relay], stage_timeout).await {
                Ok((_, rtt_ms)) => {
                    let mut link = self.direct_link(socket, session, *relay, rtt_ms);
                    link.mode = TransportMode::Relayed(RelayMode::RelayedUdp);
                    return Ok(link);
                }
                Err(e) => debug!("릴레이 UDP 단계 실패: {} ({})", relay.addr, e),
            }

            // 2단계: 스트림
            if let Ok(Ok(stream)) = timeout(
                Duration::from_millis(stage_timeout),
                TcpStream::connect(relay.addr),
            )
            .await
            {
                return Ok(self.stream_link(session, *relay, RelayMode::RelayedStream, stream));
            }
            debug!("릴레이 스트림 단계 실패: {}", relay.addr);

            // 3단계: TLS 443
            let tls_addr = SocketAddr::new(relay.addr.ip(), 443);
            if let Ok(Ok(stream)) = timeout(
                Duration::from_millis(stage_timeout),
                TcpStream::connect(tls_addr),
            )
            .await
            {
                return Ok(self.stream_link(session, *relay, RelayMode::RelayedTls443, stream));
            }
            debug!("릴레이 TLS 443 단계 실패: {}", tls_addr);
        }

        Err(Error::RelayUnreachable)
    }

    fn stream_link(
        &self,
        session: &mut LinkSession,
        relay: Candidate,
        mode: RelayMode,
        stream: TcpStream,
    ) -> EstablishedLink {
        EstablishedLink {
            mode: TransportMode::Relayed(mode),
            remote_addr: relay.addr,
            rtt_ms: 0.0,
            elapsed: Duration::ZERO,
            session: LinkSession {
                strategy: session.strategy,
                local_candidates: std::mem::take(&mut session.local_candidates),
                remote_candidates: std::mem::take(&mut session.remote_candidates),
                attempt: session.attempt,
            },
            io: LinkIo::Stream(stream),
        }
    }
}
