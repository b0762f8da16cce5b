use strum_macros::Display;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    WebRTCError(#[from] webrtc::error::Error),
    #[error(transparent)]
    UtilError(#[from] webrtc_util::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
    #[error("mux error {kind}: {message}")]
    MuxError { message: String, kind: MuxErrorKind },
    #[error("transport error {kind}: {message}")]
    TransportError {
        message: String,
        kind: TransportErrorKind,
    },
    #[error("buffer error {kind}: {message}")]
    BufferError {
        message: String,
        kind: BufferErrorKind,
    },
    #[error("router error {kind}: {message}")]
    RouterError {
        message: String,
        kind: RouterErrorKind,
    },
    #[error("receiver error {kind}: {message}")]
    ReceiverError {
        message: String,
        kind: ReceiverErrorKind,
    },
    #[error("down track error {kind}: {message}")]
    DownTrackError {
        message: String,
        kind: DownTrackErrorKind,
    },
    #[error("session error {kind}: {message}")]
    SessionError {
        message: String,
        kind: SessionErrorKind,
    },
    #[error("service id error {kind}: {message}")]
    ServiceIdError {
        message: String,
        kind: ServiceIdErrorKind,
    },
}

#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum MuxErrorKind {
    BufferFullError,
    BufferClosedError,
    ShortBufferError,
    QueueFullError,
    StreamClosedError,
    MuxClosedError,
}

#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum TransportErrorKind {
    NoConnectionError,
    ConnectionClosedError,
    RtcpMarshalError,
    RtpMarshalError,
    ShortWriteError,
}

#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum BufferErrorKind {
    BufferClosedError,
    PacketNotFoundError,
    ShortWriteError,
    RtpParseError,
}

#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum RouterErrorKind {
    RouterStoppedError,
    SubscriberClosedError,
}

#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum ReceiverErrorKind {
    NoSuchLayerError,
    ReceiverClosedError,
}

#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum DownTrackErrorKind {
    EndOfStreamError,
}

#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum SessionErrorKind {
    NotJoinedError,
    PeerClosedError,
    WorkerClosedError,
}

#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum ServiceIdErrorKind {
    MalformedError,
    UnknownServiceNameError,
}

impl Error {
    pub fn new_mux(message: String, kind: MuxErrorKind) -> Self {
        Error::MuxError { message, kind }
    }

    pub fn new_transport(message: String, kind: TransportErrorKind) -> Self {
        Error::TransportError { message, kind }
    }

    pub fn new_buffer(message: String, kind: BufferErrorKind) -> Self {
        Error::BufferError { message, kind }
    }

    pub fn new_router(message: String, kind: RouterErrorKind) -> Self {
        Error::RouterError { message, kind }
    }

    pub fn new_receiver(message: String, kind: ReceiverErrorKind) -> Self {
        Error::ReceiverError { message, kind }
    }

    pub fn new_down_track(message: String, kind: DownTrackErrorKind) -> Self {
        Error::DownTrackError { message, kind }
    }

    pub fn new_session(message: String, kind: SessionErrorKind) -> Self {
        Error::SessionError { message, kind }
    }

    pub fn new_service_id(message: String, kind: ServiceIdErrorKind) -> Self {
        Error::ServiceIdError { message, kind }
    }

    /// A forwarder reports this when its subscriber has gone away.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            Error::DownTrackError {
                kind: DownTrackErrorKind::EndOfStreamError,
                ..
            }
        )
    }

    /// End-of-buffer sentinel returned by [`crate::buffer::Buffer::get_packet`].
    pub fn is_buffer_closed(&self) -> bool {
        matches!(
            self,
            Error::BufferError {
                kind: BufferErrorKind::BufferClosedError,
                ..
            }
        )
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(
            self,
            Error::MuxError {
                kind: MuxErrorKind::QueueFullError,
                ..
            }
        )
    }
}
