//! 연결 전략 선택
//!
//! 로컬/원격 NAT 분류 조합에 대한 고정 결정 테이블.
//! 우선순위 순으로 첫 일치 행이 선택된다. 네트워크 IO 없음.

use crate::nat::NatClass;

/// 연결 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyMode {
    /// 직결 우선
    Direct,

    /// 직결 시도 후 릴레이 폴백
    RelayFallback,

    /// 릴레이 전용 (직결 시도 생략)
    RelayOnly,
}

/// 연결 전략
///
/// `(로컬 분류, 원격 분류)`의 순수 함수 출력. 시도마다 재계산된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStrategy {
    /// 연결 모드
    pub mode: StrategyMode,

    /// 직결 시도 타임아웃 (밀리초, RelayOnly면 0)
    pub direct_attempt_timeout_ms: u64,

    /// 릴레이 후보를 우선순위 상위로 둘지
    pub prefer_relay_candidates: bool,

    /// 선택 근거
    pub reason: &'static str,
}

/// 전략 선택 (순수, 전역 함수)
///
/// 결정 테이블 (첫 일치 우선):
/// 1. 한쪽이라도 Blocked ⇒ RelayOnly, 0ms
/// 2. 양쪽 Symmetric ⇒ RelayOnly, 0ms
/// 3. 한쪽만 Symmetric ⇒ RelayFallback, 5000ms
/// 4. 양쪽 PortRestricted ⇒ RelayFallback, 8000ms
/// 5. PortRestricted/AddressRestricted 혼합 ⇒ RelayFallback, 10000ms
/// 6. 한쪽이라도 Unknown ⇒ RelayFallback, 8000ms
/// 7. 그 외 (유리한 콘형 조합) ⇒ Direct, 15000ms
pub fn select(local: NatClass, remote: NatClass) -> ConnectionStrategy {
    use NatClass::*;

    // 1. 차단된 엔드포인트
    if local == Blocked || remote == Blocked {
        return ConnectionStrategy {
            mode: StrategyMode::RelayOnly,
            direct_attempt_timeout_ms: 0,
            prefer_relay_candidates: true,
            reason: "endpoint unreachable without relay",
        };
    }

    // 2. 양쪽 대칭형
    if local == Symmetric && remote == Symmetric {
        return ConnectionStrategy {
            mode: StrategyMode::RelayOnly,
            direct_attempt_timeout_ms: 0,
            prefer_relay_candidates: true,
            reason: "both endpoints behind symmetric NAT",
        };
    }

    // 3. 한쪽만 대칭형
    if local == Symmetric || remote == Symmetric {
        return ConnectionStrategy {
            mode: StrategyMode::RelayFallback,
            direct_attempt_timeout_ms: 5000,
            prefer_relay_candidates: true,
            reason: "one symmetric endpoint, direct punch unlikely",
        };
    }

    // 4. 양쪽 포트 제한
    if local == PortRestricted && remote == PortRestricted {
        return ConnectionStrategy {
            mode: StrategyMode::RelayFallback,
            direct_attempt_timeout_ms: 8000,
            prefer_relay_candidates: false,
            reason: "both endpoints port-restricted",
        };
    }

    // 5. 포트 제한 / 주소 제한 혼합
    if (local == PortRestricted && remote == AddressRestricted)
        || (local == AddressRestricted && remote == PortRestricted)
    {
        return ConnectionStrategy {
            mode: StrategyMode::RelayFallback,
            direct_attempt_timeout_ms: 10000,
            prefer_relay_candidates: false,
            reason: "mixed restricted cone endpoints",
        };
    }

    // 6. 판별 불가
    if local == Unknown || remote == Unknown {
        return ConnectionStrategy {
            mode: StrategyMode::RelayFallback,
            direct_attempt_timeout_ms: 8000,
            prefer_relay_candidates: false,
            reason: "unknown classification, conservative fallback",
        };
    }

    // 7. 유리한 콘형 조합
    ConnectionStrategy {
        mode: StrategyMode::Direct,
        direct_attempt_timeout_ms: 15000,
        prefer_relay_candidates: false,
        reason: "favorable cone combination",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NatClass::*;

    const ALL: [NatClass; 6] = [
        FullCone,
        AddressRestricted,
        PortRestricted,
        Symmetric,
        Blocked,
        Unknown,
    ];

    #[test]
    fn test_full_cone_both_sides_is_direct() {
        let s = select(FullCone, FullCone);
        assert_eq!(s.mode, StrategyMode::Direct);
        assert_eq!(s.direct_attempt_timeout_ms, 15000);
    }

    #[test]
    fn test_symmetric_both_sides_is_relay_only() {
        let s = select(Symmetric, Symmetric);
        assert_eq!(s.mode, StrategyMode::RelayOnly);
        assert_eq!(s.direct_attempt_timeout_ms, 0);
    }

    #[test]
    fn test_blocked_overrides_everything() {
        for remote in ALL {
            let s = select(Blocked, remote);
            assert_eq!(s.mode, StrategyMode::RelayOnly);
            assert_eq!(s.direct_attempt_timeout_ms, 0);
        }
    }

    #[test]
    fn test_one_symmetric_side() {
        let s = select(Symmetric, FullCone);
        assert_eq!(s.mode, StrategyMode::RelayFallback);
        assert_eq!(s.direct_attempt_timeout_ms, 5000);
        assert!(s.prefer_relay_candidates);
    }

    #[test]
    fn test_both_port_restricted() {
        let s = select(PortRestricted, PortRestricted);
        assert_eq!(s.mode, StrategyMode::RelayFallback);
        assert_eq!(s.direct_attempt_timeout_ms, 8000);
    }

    #[test]
    fn test_mixed_restricted() {
        let s = select(PortRestricted, AddressRestricted);
        assert_eq!(s.mode, StrategyMode::RelayFallback);
        assert_eq!(s.direct_attempt_timeout_ms, 10000);
    }

    #[test]
    fn test_unknown_is_conservative() {
        let s = select(Unknown, FullCone);
        assert_eq!(s.mode, StrategyMode::RelayFallback);
        assert_eq!(s.direct_attempt_timeout_ms, 8000);
    }

    #[test]
    fn test_total_over_all_inputs() {
        // 모든 조합에서 패닉 없이 유효한 전략 산출
        for local in ALL {
            for remote in ALL {
                let s = select(local, remote);
                assert!(!s.reason.is_empty());
                if s.mode == StrategyMode::RelayOnly {
                    assert_eq!(s.direct_attempt_timeout_ms, 0);
                } else {
                    assert!(s.direct_attempt_timeout_ms > 0);
                }
            }
        }
    }

    #[test]
    fn test_mode_is_symmetric_in_arguments() {
        // 테이블 행이 대칭인 조합은 인자 순서와 무관하게 같은 모드
        for local in ALL {
            for remote in ALL {
                assert_eq!(select(local, remote).mode, select(remote, local).mode);
            }
        }
    }
}
