use rq_common::EndpointAddress;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] rq_queue::QueueError),

    #[error(transparent)]
    Protocol(#[from] rq_protocol::ProtocolError),

    #[error("No link to destination {0}")]
    NoLink(EndpointAddress),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Engine is shut down")]
    Shutdown,
}
