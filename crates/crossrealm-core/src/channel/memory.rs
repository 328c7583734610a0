//! In-process channel transport.
//!
//! Both ends live in the same process and share one close flag, so closing
//! either end ends the inbound stream of both.

use super::{ChannelHandle, ChannelState, Inbound, Port};
use crate::realm::SenderDescriptor;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Create a connected pair of ports.
///
/// `a` describes the realm holding the first port and `b` the realm holding
/// the second; each port reports the *other* descriptor as its remote.
pub fn pair(name: &str, a: SenderDescriptor, b: SenderDescriptor) -> (Port, Port) {
    let state = ChannelState::new(name);
    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();

    let port_a = Port {
        handle: ChannelHandle {
            state: state.clone(),
            outbound: a_to_b_tx,
            remote: Arc::new(b),
        },
        inbound: Inbound {
            rx: b_to_a_rx,
            closed: state.closed.subscribe(),
        },
    };
    let port_b = Port {
        handle: ChannelHandle {
            state: state.clone(),
            outbound: b_to_a_tx,
            remote: Arc::new(a),
        },
        inbound: Inbound {
            rx: a_to_b_rx,
            closed: state.closed.subscribe(),
        },
    };

    (port_a, port_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realm::RealmKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, mut b) = pair(
            "test",
            SenderDescriptor::controller("ext"),
            SenderDescriptor::page("ext", 1, 0),
        );

        for i in 0..5 {
            a.handle.send_value(json!(i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(b.inbound.recv().await, Some(json!(i)));
        }
    }

    #[tokio::test]
    async fn test_pair_reports_far_side_as_remote() {
        let (a, b) = pair(
            "test",
            SenderDescriptor::controller("ext"),
            SenderDescriptor::page("ext", 1, 0),
        );
        assert_eq!(a.handle.remote().kind, RealmKind::Page);
        assert_eq!(b.handle.remote().kind, RealmKind::Controller);
        assert_eq!(a.handle.id(), b.handle.id());
    }

    #[tokio::test]
    async fn test_close_ends_both_streams() {
        let (mut a, mut b) = pair(
            "test",
            SenderDescriptor::controller("ext"),
            SenderDescriptor::panel("ext", 1),
        );
        b.handle.close();

        assert!(a.handle.is_closed());
        assert_eq!(a.inbound.recv().await, None);
        assert_eq!(b.inbound.recv().await, None);
    }
}
