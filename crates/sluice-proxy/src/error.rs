// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Closed failure taxonomy for the proxy engine.
//!
//! Every raw failure a branch can hit — resolver faults, connect errors, TLS
//! handshake failures, SIP failure responses, timeouts — is classified into a
//! [`ProxyError`] value carrying a stable numeric code. Errors are data here:
//! they travel by value through the engine and never double as control flow.

use std::net::SocketAddr;

use smol_str::SmolStr;
use thiserror::Error;

use sluice_msg::Response;

use crate::target::TransportKind;

/// Stable numeric codes for downstream alerting. Grouped in blocks so new
/// sub-causes can be added without renumbering.
pub mod codes {
    pub const UNIDENTIFIED: u16 = 1000;

    pub const FAILURE_RESPONSE: u16 = 1100;
    pub const REQUEST_TIMED_OUT: u16 = 1101;
    pub const RESPONSE_SEND_FAILURE: u16 = 1102;

    pub const CLIENT_UNREACHABLE: u16 = 1200;

    pub const TCP_CONNECTION_REFUSED: u16 = 1300;
    pub const TCP_CONNECTION_TIMEDOUT: u16 = 1301;
    pub const TCP_CONNECTION_OTHER: u16 = 1302;

    pub const TLS_NO_TRUSTED_CERT: u16 = 1400;
    pub const TLS_SELF_SIGNED: u16 = 1401;
    pub const TLS_CERT_EXPIRED: u16 = 1402;
    pub const TLS_CERT_NOT_YET_VALID: u16 = 1403;
    pub const TLS_CERT_REVOKED: u16 = 1404;
    pub const TLS_CHAIN_ERROR: u16 = 1405;
    pub const TLS_HOSTNAME_MISMATCH: u16 = 1406;
    pub const TLS_ALERT_RECEIVED: u16 = 1407;
    pub const TLS_PROTOCOL_VERSION: u16 = 1408;
    pub const TLS_CIPHER_MISMATCH: u16 = 1409;
    pub const TLS_HANDSHAKE_TIMEOUT: u16 = 1410;
    pub const TLS_HANDSHAKE_OTHER: u16 = 1411;

    pub const DNS_SRV_NO_RECORDS: u16 = 1500;
    pub const DNS_SRV_QUERY_TIMEDOUT: u16 = 1501;
    pub const DNS_SRV_OTHER: u16 = 1502;
    pub const DNS_A_NO_RECORDS: u16 = 1510;
    pub const DNS_A_QUERY_TIMEDOUT: u16 = 1511;
    pub const DNS_A_OTHER: u16 = 1512;

    pub const SERVER_GROUP_DOWN: u16 = 1600;

    pub const ROUTING_SCRIPT_FAILURE: u16 = 1700;
}

/// Local/remote addressing context attached to transport-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub transport: TransportKind,
}

impl Binding {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            local: None,
            remote: None,
            transport,
        }
    }

    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }
}

/// DNS query type the resolver was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsQuery {
    Srv,
    A,
}

/// Classified DNS failure cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsCause {
    NoRecords,
    QueryTimedOut,
    Other,
}

/// Classified TCP connect failure cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpCause {
    Refused,
    TimedOut,
    Other,
}

/// Classified TLS handshake failure cause.
///
/// Selected by [`classify_tls_text`], which is best-effort string matching —
/// see that function for the caveats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsCause {
    NoTrustedCert,
    SelfSigned,
    CertificateExpired,
    CertificateNotYetValid,
    CertificateRevoked,
    ChainError,
    HostnameMismatch,
    AlertReceived,
    ProtocolVersion,
    CipherMismatch,
    HandshakeTimeout,
    Other,
}

/// Classified proxy failure. The single error currency of the engine.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("client unreachable")]
    ClientUnreachable { binding: Option<Binding> },

    #[error("DNS {query:?} lookup failed ({cause:?}): {detail}")]
    Dns {
        query: DnsQuery,
        cause: DnsCause,
        detail: SmolStr,
    },

    #[error("TCP connect failed ({cause:?})")]
    TcpConnect {
        cause: TcpCause,
        binding: Option<Binding>,
    },

    #[error("TLS handshake failed ({cause:?}): {detail}")]
    TlsHandshake {
        cause: TlsCause,
        detail: SmolStr,
        binding: Option<Binding>,
    },

    #[error("SIP failure response {}", .response.code())]
    FailureResponse { response: Response },

    #[error("request timed out")]
    RequestTimedOut,

    #[error("failed to send response upstream: {detail}")]
    ResponseSendFailure { detail: SmolStr },

    #[error("server group {group} down")]
    ServerGroupDown { group: SmolStr },

    #[error("routing script failure: {detail}")]
    RoutingScriptFailure { detail: SmolStr },

    #[error("unidentified proxy failure: {detail}")]
    Unidentified { detail: SmolStr },
}

impl ProxyError {
    /// Returns the stable numeric code for this error.
    pub fn code(&self) -> u16 {
        use codes::*;
        match self {
            ProxyError::ClientUnreachable { .. } => CLIENT_UNREACHABLE,
            ProxyError::Dns { query, cause, .. } => match (query, cause) {
                (DnsQuery::Srv, DnsCause::NoRecords) => DNS_SRV_NO_RECORDS,
                (DnsQuery::Srv, DnsCause::QueryTimedOut) => DNS_SRV_QUERY_TIMEDOUT,
                (DnsQuery::Srv, DnsCause::Other) => DNS_SRV_OTHER,
                (DnsQuery::A, DnsCause::NoRecords) => DNS_A_NO_RECORDS,
                (DnsQuery::A, DnsCause::QueryTimedOut) => DNS_A_QUERY_TIMEDOUT,
                (DnsQuery::A, DnsCause::Other) => DNS_A_OTHER,
            },
            ProxyError::TcpConnect { cause, .. } => match cause {
                TcpCause::Refused => TCP_CONNECTION_REFUSED,
                TcpCause::TimedOut => TCP_CONNECTION_TIMEDOUT,
                TcpCause::Other => TCP_CONNECTION_OTHER,
            },
            ProxyError::TlsHandshake { cause, .. } => match cause {
                TlsCause::NoTrustedCert => TLS_NO_TRUSTED_CERT,
                TlsCause::SelfSigned => TLS_SELF_SIGNED,
                TlsCause::CertificateExpired => TLS_CERT_EXPIRED,
                TlsCause::CertificateNotYetValid => TLS_CERT_NOT_YET_VALID,
                TlsCause::CertificateRevoked => TLS_CERT_REVOKED,
                TlsCause::ChainError => TLS_CHAIN_ERROR,
                TlsCause::HostnameMismatch => TLS_HOSTNAME_MISMATCH,
                TlsCause::AlertReceived => TLS_ALERT_RECEIVED,
                TlsCause::ProtocolVersion => TLS_PROTOCOL_VERSION,
                TlsCause::CipherMismatch => TLS_CIPHER_MISMATCH,
                TlsCause::HandshakeTimeout => TLS_HANDSHAKE_TIMEOUT,
                TlsCause::Other => TLS_HANDSHAKE_OTHER,
            },
            ProxyError::FailureResponse { .. } => FAILURE_RESPONSE,
            ProxyError::RequestTimedOut => REQUEST_TIMED_OUT,
            ProxyError::ResponseSendFailure { .. } => RESPONSE_SEND_FAILURE,
            ProxyError::ServerGroupDown { .. } => SERVER_GROUP_DOWN,
            ProxyError::RoutingScriptFailure { .. } => ROUTING_SCRIPT_FAILURE,
            ProxyError::Unidentified { .. } => UNIDENTIFIED,
        }
    }

    /// Returns the binding context for transport-level failures.
    pub fn binding(&self) -> Option<&Binding> {
        match self {
            ProxyError::ClientUnreachable { binding }
            | ProxyError::TcpConnect { binding, .. }
            | ProxyError::TlsHandshake { binding, .. } => binding.as_ref(),
            _ => None,
        }
    }

    /// Returns the SIP response that carried the failure, if any.
    pub fn response(&self) -> Option<&Response> {
        match self {
            ProxyError::FailureResponse { response } => Some(response),
            _ => None,
        }
    }
}

/// Fault surface of the resolver collaborator, already shaped as data.
#[derive(Debug, Clone, Error)]
pub enum ResolveFault {
    #[error("no records found")]
    NoRecords,
    #[error("query timed out")]
    Timeout,
    #[error("{0}")]
    Other(SmolStr),
}

/// Resolver failure: the fault plus the query type that produced it.
#[derive(Debug, Clone, Error)]
#[error("{query:?} resolution failed: {fault}")]
pub struct ResolveError {
    pub query: DnsQuery,
    pub fault: ResolveFault,
}

/// Fault surface of the transport collaborator.
#[derive(Debug, Error)]
pub enum TransportFault {
    #[error("connect failed: {kind:?}")]
    Connect {
        kind: std::io::ErrorKind,
        binding: Binding,
    },
    #[error("TLS handshake failed: {detail}")]
    Handshake { detail: String, binding: Binding },
    #[error("destination unreachable")]
    Unreachable { binding: Binding },
    #[error("transport failure: {detail}")]
    Other { detail: String },
}

/// Classifies a resolver failure into the DNS error taxonomy.
pub fn classify_resolve_error(err: &ResolveError) -> ProxyError {
    let cause = match &err.fault {
        ResolveFault::NoRecords => DnsCause::NoRecords,
        ResolveFault::Timeout => DnsCause::QueryTimedOut,
        ResolveFault::Other(_) => DnsCause::Other,
    };
    ProxyError::Dns {
        query: err.query,
        cause,
        detail: SmolStr::new(err.fault.to_string()),
    }
}

/// Classifies a connect-stage I/O error kind into the TCP taxonomy.
pub fn classify_connect_error(kind: std::io::ErrorKind, binding: Option<Binding>) -> ProxyError {
    let cause = match kind {
        std::io::ErrorKind::ConnectionRefused => TcpCause::Refused,
        std::io::ErrorKind::TimedOut => TcpCause::TimedOut,
        _ => TcpCause::Other,
    };
    ProxyError::TcpConnect { cause, binding }
}

/// Known handshake-failure phrases, checked in order against the lowercased
/// error text. First match wins.
const TLS_PHRASES: &[(&str, TlsCause)] = &[
    ("unknownissuer", TlsCause::NoTrustedCert),
    ("unknown issuer", TlsCause::NoTrustedCert),
    ("no trusted", TlsCause::NoTrustedCert),
    ("self signed", TlsCause::SelfSigned),
    ("self-signed", TlsCause::SelfSigned),
    ("expired", TlsCause::CertificateExpired),
    ("not yet valid", TlsCause::CertificateNotYetValid),
    ("notvalidyet", TlsCause::CertificateNotYetValid),
    ("revoked", TlsCause::CertificateRevoked),
    ("chain", TlsCause::ChainError),
    ("bad der", TlsCause::ChainError),
    ("not valid for name", TlsCause::HostnameMismatch),
    ("notvalidforname", TlsCause::HostnameMismatch),
    ("hostname", TlsCause::HostnameMismatch),
    ("alert", TlsCause::AlertReceived),
    ("protocol version", TlsCause::ProtocolVersion),
    ("unsupported version", TlsCause::ProtocolVersion),
    ("cipher", TlsCause::CipherMismatch),
    ("handshake failure", TlsCause::CipherMismatch),
    ("timed out", TlsCause::HandshakeTimeout),
    ("timeout", TlsCause::HandshakeTimeout),
];

/// Classifies a TLS handshake failure from its error text.
///
/// This is best-effort by construction: the phrases come from observed
/// rustls/openssl message text and are not a stable API of either library.
/// Anything unmatched lands on [`TlsCause::Other`]; treat the named causes
/// as a debugging aid, not an authoritative diagnosis.
pub fn classify_tls_text(detail: &str, binding: Option<Binding>) -> ProxyError {
    let lowered = detail.to_ascii_lowercase();
    let cause = TLS_PHRASES
        .iter()
        .find(|(phrase, _)| lowered.contains(phrase))
        .map(|(_, cause)| *cause)
        .unwrap_or(TlsCause::Other);
    ProxyError::TlsHandshake {
        cause,
        detail: SmolStr::new(detail),
        binding,
    }
}

/// Classifies a transport collaborator fault into the proxy taxonomy.
pub fn classify_transport_fault(fault: &TransportFault) -> ProxyError {
    match fault {
        TransportFault::Connect { kind, binding } => {
            classify_connect_error(*kind, Some(*binding))
        }
        TransportFault::Handshake { detail, binding } => {
            classify_tls_text(detail, Some(*binding))
        }
        TransportFault::Unreachable { binding } => ProxyError::ClientUnreachable {
            binding: Some(*binding),
        },
        TransportFault::Other { detail } => ProxyError::Unidentified {
            detail: SmolStr::new(detail.as_str()),
        },
    }
}
