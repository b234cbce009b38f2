use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::error::QueryError;
use crate::message::{MessageType, Request, Response};

/// Matches an incoming response to the outstanding request that expects it.
///
/// Two keys are equal iff they name the same response type and the same peer.
/// The peer address is normalized on construction, so an IPv4-mapped IPv6
/// address compares equal to its plain IPv4 form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    response_type: MessageType,
    peer: SocketAddr,
}

impl CorrelationKey {
    pub fn new(response_type: MessageType, peer: SocketAddr) -> Self {
        let peer = SocketAddr::new(peer.ip().to_canonical(), peer.port());
        CorrelationKey {
            response_type,
            peer,
        }
    }

    pub fn response_type(&self) -> MessageType {
        self.response_type
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.response_type, self.peer)
    }
}

/// Derives [CorrelationKey]s from requests (before sending) and from
/// responses (after decoding).
///
/// The request→response directory is fixed at construction by the protocol
/// binding, e.g. [source::directory](crate::source::directory).
#[derive(Debug, Clone, Default)]
pub struct KeyFactory {
    directory: HashMap<MessageType, MessageType>,
}

impl KeyFactory {
    pub fn new(directory: HashMap<MessageType, MessageType>) -> Self {
        KeyFactory { directory }
    }

    /// The response type expected for `request_type`, if one is mapped.
    pub fn expected_response(&self, request_type: MessageType) -> Option<MessageType> {
        self.directory.get(&request_type).copied()
    }

    /// Fails with [QueryError::UnmappedRequestType] if the request's kind has no
    /// directory entry.
    pub fn derive_from_request<R: Request + ?Sized>(
        &self,
        request: &R,
    ) -> Result<CorrelationKey, QueryError> {
        let request_type = request.message_type();
        let response_type = self
            .expected_response(request_type)
            .ok_or(QueryError::UnmappedRequestType(request_type))?;
        Ok(CorrelationKey::new(response_type, request.recipient()))
    }

    /// Always succeeds: the response's declared type and sender are trusted.
    pub fn derive_from_response<S: Response + ?Sized>(&self, response: &S) -> CorrelationKey {
        CorrelationKey::new(response.message_type(), response.sender())
    }
}

impl FromIterator<(MessageType, MessageType)> for KeyFactory {
    fn from_iter<I: IntoIterator<Item = (MessageType, MessageType)>>(iter: I) -> Self {
        KeyFactory::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    use crate::test_support::{addr, factory, TestRequest, TestResponse, PING, PONG, STATUS};

    #[rstest]
    #[case("10.0.0.5:27015", "10.0.0.5:27015")]
    #[case("10.0.0.5:27015", "[::ffff:10.0.0.5]:27015")]
    #[case("[::ffff:192.168.1.2]:27016", "192.168.1.2:27016")]
    fn request_and_response_keys_match(#[case] to: &str, #[case] from: &str) {
        let factory = factory();
        let request = TestRequest::new(PING, addr(to), 1);
        let response = TestResponse::new(PONG, addr(from), 1);

        let by_request = factory.derive_from_request(&request).unwrap();
        let by_response = factory.derive_from_response(&response);
        assert_eq!(by_request, by_response);
        assert_eq!(by_response, by_request);
    }

    #[rstest]
    #[case(PONG, "10.0.0.5:27016")]
    #[case(STATUS, "10.0.0.5:27015")]
    #[case(PONG, "10.0.0.6:27015")]
    fn keys_differ_by_type_or_peer(#[case] kind: MessageType, #[case] from: &str) {
        let expected = CorrelationKey::new(PONG, addr("10.0.0.5:27015"));
        assert_ne!(expected, CorrelationKey::new(kind, addr(from)));
    }

    #[test]
    fn unmapped_request_type_is_rejected() {
        let request = TestRequest::new(STATUS, addr("10.0.0.5:27015"), 0);
        match factory().derive_from_request(&request) {
            Err(QueryError::UnmappedRequestType(kind)) => assert_eq!(kind, STATUS),
            other => panic!("expected UnmappedRequestType, got {other:?}"),
        }
    }

    #[test]
    fn duplicated_key_is_independent_and_equal() {
        let key = CorrelationKey::new(PONG, addr("10.0.0.5:27015"));
        let copy = key.clone();
        drop(key);
        assert_eq!(copy.to_string(), "(PONG, 10.0.0.5:27015)");
    }
}
