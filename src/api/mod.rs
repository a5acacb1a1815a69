// Copyright 2025 The sctp-channel Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use crate::channel::SctpChannel;
pub use crate::config::OptionTarget;
pub use crate::config::SctpChannelConfig;
pub use crate::config::SctpServerChannelConfig;
pub use crate::executor::EventLoop;
pub use crate::executor::OpFuture;
pub use crate::executor::OpPromise;
pub use crate::notification::SctpNotificationHandler;
pub use crate::pipeline::FileRegion;
pub use crate::pipeline::InboundEvents;
pub use crate::pipeline::OperationHandler;
pub use crate::pipeline::OutboundContext;
pub use crate::pipeline::OutboundInvoker;
pub use crate::pipeline::OutboundPipeline;

/// Stream Identifier
///
/// Identifies an independently ordered sub-channel within an association.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StreamId(pub u16);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload Protocol Identifier (PPID)
///
/// An application-defined 32-bit tag carried with each SCTP message. The
/// transport performs no byte order modification of this value.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct PpId(pub u32);

impl fmt::Debug for PpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for PpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An SCTP message is a group of bytes sent and received as a whole on a specified stream
/// identifier, together with a payload protocol identifier and an unordered delivery flag.
///
/// Messages are immutable once constructed. Ownership of the payload transfers into the
/// channel when writing and out of the channel when reading.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SctpMessage {
    stream_id: StreamId,
    ppid: PpId,
    unordered: bool,
    payload: Vec<u8>,
}

impl SctpMessage {
    /// Creates a new ordered `SctpMessage`.
    pub fn new(stream_id: StreamId, ppid: PpId, payload: Vec<u8>) -> Self {
        SctpMessage { stream_id, ppid, unordered: false, payload }
    }

    /// Creates a new `SctpMessage` with unordered delivery.
    pub fn new_unordered(stream_id: StreamId, ppid: PpId, payload: Vec<u8>) -> Self {
        SctpMessage { stream_id, ppid, unordered: true, payload }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn ppid(&self) -> PpId {
        self.ppid
    }

    pub fn is_unordered(&self) -> bool {
        self.unordered
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the message, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Ancillary information attached to an outgoing message.
///
/// Carries the association the message is sent on, an optional destination address (`None`
/// selects the primary path) and the per-message metadata.
#[derive(Clone, Debug)]
pub struct MessageInfo {
    pub association: Option<Association>,
    pub address: Option<SocketAddr>,
    pub stream_id: StreamId,
    pub ppid: PpId,
    pub unordered: bool,
}

impl MessageInfo {
    /// Creates ancillary information for an outgoing message on the primary path.
    pub fn outgoing(association: Option<Association>, stream_id: StreamId) -> Self {
        MessageInfo {
            association,
            address: None,
            stream_id,
            ppid: PpId(0),
            unordered: false,
        }
    }
}

/// A handle identifying a live SCTP association.
///
/// Present iff the channel is connected. The handle is a read-only snapshot obtained on
/// demand; it is not updated after retrieval.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Association {
    /// Kernel association identifier.
    pub id: i32,
    /// Number of streams the peer may use towards this endpoint.
    pub inbound_streams: u16,
    /// Number of streams this endpoint may use towards the peer.
    pub outbound_streams: u16,
    /// The peer's last announced receiver window size.
    pub peer_rwnd: u32,
}

/// The state of an association as reported by an association change notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssocChangeEvent {
    /// A new association is now ready.
    CommUp,
    /// The association has failed.
    CommLost,
    /// The peer has restarted.
    Restart,
    /// The association has gracefully terminated.
    ShutdownComplete,
    /// The association failed to be established.
    CantStartAssoc,
}

/// The state of a peer address as reported by a peer address change notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerAddrEvent {
    /// The address is now reachable.
    Available,
    /// The address can no longer be reached.
    Unreachable,
    /// The address was removed from the association.
    Removed,
    /// The address was added to the association.
    Added,
    /// The address was made the primary destination.
    MadePrimary,
    /// The address has been confirmed as valid.
    Confirmed,
}

/// Kernel payload of an association change notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssociationChange {
    pub event: AssocChangeEvent,
    pub error: u16,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub assoc_id: i32,
}

/// Kernel payload of a peer address change notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerAddressChange {
    pub address: Option<SocketAddr>,
    pub event: PeerAddrEvent,
    pub error: u32,
    pub assoc_id: i32,
}

/// Kernel payload of a send failed notification, carrying the undelivered data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendFailed {
    pub error: u32,
    pub stream_id: StreamId,
    pub ppid: PpId,
    pub unsent_data: Vec<u8>,
    pub assoc_id: i32,
}

/// Kernel payload of a shutdown notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Shutdown {
    pub assoc_id: i32,
}

/// An out-of-band event from the SCTP stack, delivered interleaved with messages
/// during receive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Notification {
    AssociationChange(AssociationChange),
    PeerAddressChange(PeerAddressChange),
    SendFailed(SendFailed),
    Shutdown(Shutdown),
}

/// Opaque per-receive attachment passed through to notification user events.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// A notification paired with the attachment of the receive that produced it. Published
/// on the pipeline's user event lane.
#[derive(Clone)]
pub struct NotificationEvent {
    pub notification: Notification,
    pub attachment: Option<Attachment>,
}

impl fmt::Debug for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationEvent")
            .field("notification", &self.notification)
            .field("attachment", &self.attachment.is_some())
            .finish()
    }
}

/// Continuation verdict returned by a notification handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerResult {
    /// Keep receiving.
    Continue,
    /// Stop the current receive.
    Return,
}

/// Receives out-of-band notifications during a kernel receive, synchronously on the
/// calling thread.
pub trait NotificationHandler {
    fn handle_notification(
        &self,
        notification: Notification,
        attachment: Option<Attachment>,
    ) -> HandlerResult;
}

/// Channel lifecycle state. `Closed` is terminal.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ChannelState {
    Fresh,
    Bound,
    Connected,
    Closed,
}

/// A channel configuration option key.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SocketOption {
    /// Receive buffer size in bytes. Must be positive. Defaults to 32768.
    SoRcvbuf,
    /// Send buffer size in bytes. Must be positive. Defaults to 32768.
    SoSndbuf,
    /// Address reuse. Defaults to false.
    SoReuseaddr,
    /// Linger-on-close duration. Defaults to off.
    SoLinger,
    /// Disable message bundling delays. Defaults to true.
    SctpNodelay,
    /// Requested maximum in/out stream counts for new associations. Zero selects the
    /// kernel default.
    SctpInitMaxstreams,
    /// The peer address to use as the association primary path. Defaults to the
    /// wildcard address until an association exists.
    SctpPrimaryAddr,
    /// Connect timeout. Zero disables the timeout. Defaults to 30 seconds.
    ConnectTimeout,
    /// Bounded wait applied to each readiness poll. Defaults to 1 second.
    SoTimeout,
    /// Number of consecutive empty write-readiness polls tolerated before a flush
    /// fails. Must be positive. Defaults to 16.
    WriteSpinCount,
    /// Accept backlog, server configurations only. Must be non-negative. Defaults to
    /// the system somaxconn value.
    SoBacklog,
}

impl fmt::Display for SocketOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketOption::SoRcvbuf => "SO_RCVBUF",
            SocketOption::SoSndbuf => "SO_SNDBUF",
            SocketOption::SoReuseaddr => "SO_REUSEADDR",
            SocketOption::SoLinger => "SO_LINGER",
            SocketOption::SctpNodelay => "SCTP_NODELAY",
            SocketOption::SctpInitMaxstreams => "SCTP_INIT_MAXSTREAMS",
            SocketOption::SctpPrimaryAddr => "SCTP_PRIMARY_ADDR",
            SocketOption::ConnectTimeout => "CONNECT_TIMEOUT",
            SocketOption::SoTimeout => "SO_TIMEOUT",
            SocketOption::WriteSpinCount => "WRITE_SPIN_COUNT",
            SocketOption::SoBacklog => "SO_BACKLOG",
        };
        f.write_str(name)
    }
}

/// Requested stream counts for new associations.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InitMaxStreams {
    pub max_out_streams: u16,
    pub max_in_streams: u16,
}

/// A channel configuration option value.
#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
    Int(i32),
    Bool(bool),
    Duration(Duration),
    InitMaxStreams(InitMaxStreams),
    Addr(SocketAddr),
    Linger(Option<Duration>),
}

/// Errors surfaced by channel operations and the configuration surface.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to initialize the sctp channel: {0}")]
    InitFailed(#[source] io::Error),

    #[error("failed to bind the channel: {0}")]
    BindFailed(#[source] io::Error),

    #[error("failed to connect the channel: {0}")]
    ConnectFailed(#[source] io::Error),

    #[error("failed to write a message: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("failed to read from the channel: {0}")]
    ReadFailed(#[source] io::Error),

    #[error("channel is closed")]
    ClosedChannel,

    #[error("operation timed out")]
    Timeout,

    #[error("unknown channel option: {0}")]
    UnknownOption(SocketOption),

    #[error("invalid value for option {0}: {1}")]
    InvalidOption(SocketOption, String),

    #[error("failed to apply channel option: {0}")]
    ConfigIo(#[source] io::Error),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("flush must be overridden by handlers advertising the outbound capability")]
    MissingFlushOverride,

    #[error("channel i/o error: {0}")]
    Io(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_accessors_round_trip() {
        let m = SctpMessage::new(StreamId(2), PpId(0xDEADBEEF), vec![1, 2, 3]);
        assert_eq!(m.stream_id(), StreamId(2));
        assert_eq!(m.ppid(), PpId(0xDEADBEEF));
        assert!(!m.is_unordered());
        assert_eq!(m.payload(), &[1, 2, 3]);
        assert_eq!(m.into_payload(), vec![1, 2, 3]);
    }

    #[test]
    fn unordered_message_carries_flag() {
        let m = SctpMessage::new_unordered(StreamId(0), PpId(0), vec![]);
        assert!(m.is_unordered());
    }

    #[test]
    fn outgoing_message_info_defaults_to_primary_path() {
        let info = MessageInfo::outgoing(None, StreamId(7));
        assert!(info.address.is_none());
        assert_eq!(info.stream_id, StreamId(7));
        assert_eq!(info.ppid, PpId(0));
        assert!(!info.unordered);
    }

    #[test]
    fn option_keys_render_their_kernel_names() {
        assert_eq!(SocketOption::SoRcvbuf.to_string(), "SO_RCVBUF");
        assert_eq!(SocketOption::SctpInitMaxstreams.to_string(), "SCTP_INIT_MAXSTREAMS");
        assert_eq!(SocketOption::SoBacklog.to_string(), "SO_BACKLOG");
    }

    #[test]
    fn channel_states_are_ordered_by_lifecycle() {
        assert!(ChannelState::Fresh < ChannelState::Bound);
        assert!(ChannelState::Bound < ChannelState::Connected);
        assert!(ChannelState::Connected < ChannelState::Closed);
    }
}
