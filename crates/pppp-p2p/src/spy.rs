//! Connection lifecycle observer.

use pppp_protocol::Metadata;
use tracing::debug;

use crate::FailableValue;

/// Observer consulted during the handshake and told about lifecycle events.
///
/// One spy is shared by every connection of a node.
pub trait ConnectionSpy: Send + Sync + 'static {
    /// Called on the accepting side when IDENTIFY arrives.
    ///
    /// Failure answers REJECTION and closes the connection. Success answers
    /// OK carrying the returned metadata.
    fn intercept_connection_request(
        &self,
        version: Option<i32>,
        timestamp: i64,
        metadata: Option<&Metadata>,
    ) -> FailableValue<Metadata>;

    /// Called on the connecting side when OK arrives. Returning false closes
    /// the connection without a reply.
    fn intercept_completed_handshake(
        &self,
        version: Option<i32>,
        timestamp: i64,
        metadata: Option<&Metadata>,
    ) -> bool;

    /// Called once when an open connection closes.
    ///
    /// Connections that never completed the handshake are not reported.
    fn disconnected(&self);

    /// Called after every PONG with the measured round trip in milliseconds.
    fn latency_check(&self, latency_ms: i64);
}

/// Accepts every handshake and logs lifecycle events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpConnectionSpy;

impl ConnectionSpy for NoOpConnectionSpy {
    fn intercept_connection_request(
        &self,
        _version: Option<i32>,
        _timestamp: i64,
        _metadata: Option<&Metadata>,
    ) -> FailableValue<Metadata> {
        FailableValue::empty()
    }

    fn intercept_completed_handshake(
        &self,
        _version: Option<i32>,
        _timestamp: i64,
        _metadata: Option<&Metadata>,
    ) -> bool {
        true
    }

    fn disconnected(&self) {}

    fn latency_check(&self, latency_ms: i64) {
        debug!(latency_ms, "latency check");
    }
}

/// Accepts only peers announcing the given version.
///
/// Both sides of the handshake check the peer's version, so a mismatch is
/// refused whichever side connects.
#[derive(Debug, Clone, Copy)]
pub struct VersionSpy {
    version: i32,
}

impl VersionSpy {
    /// Creates a spy requiring `version`.
    #[must_use]
    pub const fn new(version: i32) -> Self {
        Self { version }
    }
}

impl ConnectionSpy for VersionSpy {
    fn intercept_connection_request(
        &self,
        version: Option<i32>,
        _timestamp: i64,
        _metadata: Option<&Metadata>,
    ) -> FailableValue<Metadata> {
        if version == Some(self.version) {
            FailableValue::empty()
        } else {
            debug!(expected = self.version, ?version, "refusing peer version");
            FailableValue::failed()
        }
    }

    fn intercept_completed_handshake(
        &self,
        version: Option<i32>,
        _timestamp: i64,
        _metadata: Option<&Metadata>,
    ) -> bool {
        version == Some(self.version)
    }

    fn disconnected(&self) {}

    fn latency_check(&self, latency_ms: i64) {
        debug!(latency_ms, "latency check");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_accepts_everything() {
        let spy = NoOpConnectionSpy;
        assert!(!spy.intercept_connection_request(None, 0, None).did_fail());
        assert!(spy.intercept_completed_handshake(Some(3), 0, None));
    }

    #[test]
    fn version_spy_checks_both_sides() {
        let spy = VersionSpy::new(2);
        assert!(!spy.intercept_connection_request(Some(2), 0, None).did_fail());
        assert!(spy.intercept_connection_request(Some(1), 0, None).did_fail());
        assert!(spy.intercept_connection_request(None, 0, None).did_fail());
        assert!(spy.intercept_completed_handshake(Some(2), 0, None));
        assert!(!spy.intercept_completed_handshake(None, 0, None));
    }
}
