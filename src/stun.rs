//! STUN 바인딩 요청/응답 코덱
//!
//! RFC 5389 호환 최소 구현
//! - 바인딩 요청 생성 (속성 없음, 20바이트)
//! - XOR-MAPPED-ADDRESS 우선, MAPPED-ADDRESS 폴백 파싱

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::{Error, Result};

/// STUN 메시지 타입
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

/// STUN 매직 쿠키
const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN 속성 타입
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// 트랜잭션 ID (96비트)
pub type TransactionId = [u8; 12];

/// 새 트랜잭션 ID 생성
pub fn new_transaction_id() -> TransactionId {
    rand::random()
}

/// 바인딩 요청 직렬화
pub fn build_binding_request(transaction_id: &TransactionId) -> Vec<u8> {
    let mut request = Vec::with_capacity(20);
    request.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes()); // 속성 없음
    request.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    request.extend_from_slice(transaction_id);
    request
}

/// 바인딩 응답 파싱 → 외부 매핑 주소
pub fn parse_binding_response(
    data: &[u8],
    expected_transaction_id: &TransactionId,
) -> Result<SocketAddr> {
    if data.len() < 20 {
        return Err(Error::InvalidStunResponse {
            reason: "응답이 너무 짧음",
        });
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(Error::InvalidStunResponse {
            reason: "바인딩 응답 아님",
        });
    }

    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != MAGIC_COOKIE {
        return Err(Error::InvalidStunResponse {
            reason: "매직 쿠키 불일치",
        });
    }

    if &data[8..20] != expected_transaction_id {
        return Err(Error::InvalidStunResponse {
            reason: "트랜잭션 ID 불일치",
        });
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 20 + msg_len {
        return Err(Error::InvalidStunResponse {
            reason: "응답 잘림",
        });
    }

    // 속성 순회 (4바이트 경계 패딩)
    let mut offset = 20;
    while offset + 4 <= 20 + msg_len && offset + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_len > data.len() {
            break;
        }
        let attr_data = &data[offset..offset + attr_len];

        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            return parse_xor_mapped_address(attr_data, expected_transaction_id);
        } else if attr_type == ATTR_MAPPED_ADDRESS {
            return parse_mapped_address(attr_data);
        }

        offset += (attr_len + 3) & !3;
    }

    Err(Error::InvalidStunResponse {
        reason: "주소 속성 없음",
    })
}

/// XOR-MAPPED-ADDRESS 속성 파싱
fn parse_xor_mapped_address(data: &[u8], transaction_id: &TransactionId) -> Result<SocketAddr> {
    if data.len() < 8 {
        return Err(Error::InvalidStunResponse {
            reason: "XOR-MAPPED-ADDRESS 잘림",
        });
    }

    let family = data[1];
    let xor_port = u16::from_be_bytes([data[2], data[3]]);
    let port = xor_port ^ (MAGIC_COOKIE >> 16) as u16;

    let ip = match family {
        0x01 => {
            let xor_addr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            IpAddr::from((xor_addr ^ MAGIC_COOKIE).to_be_bytes())
        }
        0x02 => {
            if data.len() < 20 {
                return Err(Error::InvalidStunResponse {
                    reason: "IPv6 주소 잘림",
                });
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);

            // 매직 쿠키 + 트랜잭션 ID로 XOR
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);
            for i in 0..16 {
                addr_bytes[i] ^= xor_key[i];
            }
            IpAddr::from(addr_bytes)
        }
        _ => {
            return Err(Error::InvalidStunResponse {
                reason: "알 수 없는 주소 패밀리",
            });
        }
    };

    Ok(SocketAddr::new(ip, port))
}

/// MAPPED-ADDRESS 속성 파싱 (폴백)
fn parse_mapped_address(data: &[u8]) -> Result<SocketAddr> {
    if data.len() < 8 {
        return Err(Error::InvalidStunResponse {
            reason: "MAPPED-ADDRESS 잘림",
        });
    }

    let family = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]);

    let ip = match family {
        0x01 => IpAddr::from([data[4], data[5], data[6], data[7]]),
        0x02 => {
            if data.len() < 20 {
                return Err(Error::InvalidStunResponse {
                    reason: "IPv6 주소 잘림",
                });
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);
            IpAddr::from(addr_bytes)
        }
        _ => {
            return Err(Error::InvalidStunResponse {
                reason: "알 수 없는 주소 패밀리",
            });
        }
    };

    Ok(SocketAddr::new(ip, port))
}

/// 단일 서버 바인딩 질의 (타임아웃 포함)
///
/// 기존 소켓을 재사용하므로 여러 서버에 같은 로컬 포트로 질의 가능
pub async fn query(
    socket: &UdpSocket,
    server: SocketAddr,
    timeout: Duration,
) -> Result<SocketAddr> {
    let transaction_id = new_transaction_id();
    let request = build_binding_request(&transaction_id);

    socket.send_to(&request, server).await?;

    let mut buf = vec![0u8; 1024];
    let deadline = tokio::time::Instant::now() + timeout;

    // 다른 서버의 늦은 응답이 섞여 도착할 수 있으므로 트랜잭션 ID가 맞을 때까지 수신
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::InvalidStunResponse {
                reason: "응답 타임아웃",
            });
        }

        let (len, from) = tokio::time::timeout(remaining, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::InvalidStunResponse {
                reason: "응답 타임아웃",
            })??;

        if from != server {
            continue;
        }

        match parse_binding_response(&buf[..len], &transaction_id) {
            Ok(mapped) => return Ok(mapped),
            Err(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 테스트용 바인딩 응답 생성 (XOR-MAPPED-ADDRESS, IPv4)
    fn build_response(transaction_id: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
        let (ip, port) = match mapped {
            SocketAddr::V4(v4) => (u32::from_be_bytes(v4.ip().octets()), v4.port()),
            SocketAddr::V6(_) => panic!("IPv4 전용 헬퍼"),
        };

        let mut attr = Vec::new();
        attr.push(0u8);
        attr.push(0x01); // IPv4
        attr.extend_from_slice(&(port ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        attr.extend_from_slice(&(ip ^ MAGIC_COOKIE).to_be_bytes());

        let mut resp = Vec::new();
        resp.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        resp.extend_from_slice(&((4 + attr.len()) as u16).to_be_bytes());
        resp.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(transaction_id);
        resp.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        resp.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        resp.extend_from_slice(&attr);
        resp
    }

    #[test]
    fn test_binding_request_layout() {
        let txid = new_transaction_id();
        let request = build_binding_request(&txid);

        assert_eq!(request.len(), 20);
        assert_eq!(u16::from_be_bytes([request[0], request[1]]), BINDING_REQUEST);
        assert_eq!(
            u32::from_be_bytes([request[4], request[5], request[6], request[7]]),
            MAGIC_COOKIE
        );
        assert_eq!(&request[8..20], &txid);
    }

    #[test]
    fn test_parse_xor_mapped_roundtrip() {
        let txid = new_transaction_id();
        let mapped: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let resp = build_response(&txid, mapped);

        let parsed = parse_binding_response(&resp, &txid).unwrap();
        assert_eq!(parsed, mapped);
    }

    #[test]
    fn test_parse_rejects_wrong_transaction_id() {
        let txid = new_transaction_id();
        let other: TransactionId = new_transaction_id();
        let resp = build_response(&txid, "198.51.100.1:1000".parse().unwrap());

        assert!(parse_binding_response(&resp, &other).is_err());
    }

    #[test]
    fn test_parse_rejects_short_packet() {
        let txid = new_transaction_id();
        assert!(parse_binding_response(&[0u8; 10], &txid).is_err());
    }
}
