use crate::protocol::ConnectionId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NetError {
    #[error("packet queue at capacity")]
    QueueFull,
    #[error("no connection with id {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is already authorized")]
    AlreadyAuthorized(ConnectionId),
    #[error("connection is not ready")]
    NotReady,
    #[error("connection is closed")]
    Closed,
}
