//! Typed request/response port between the pipeline and its backend.

use tokio::sync::mpsc;

use crate::errors::{GridError, GridResult};
use crate::fetch::protocol::{FetchRequest, ResponseFrame};

/// Outbound half of the backend channel.
///
/// Sending never blocks: the grid keeps rendering cached rows while a
/// request is in flight.
pub trait Transport {
    fn send(&self, request: &FetchRequest) -> GridResult<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&self, request: &FetchRequest) -> GridResult<()> {
        (**self).send(request)
    }
}

/// [`Transport`] over a tokio unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<FetchRequest>,
}

impl Transport for ChannelTransport {
    fn send(&self, request: &FetchRequest) -> GridResult<()> {
        self.tx
            .send(request.clone())
            .map_err(|_| GridError::Transport("backend channel closed".into()))
    }
}

/// The backend's end: incoming requests and a sender for response frames.
#[derive(Debug)]
pub struct BackendPort {
    pub requests: mpsc::UnboundedReceiver<FetchRequest>,
    pub responses: mpsc::UnboundedSender<ResponseFrame>,
}

/// Build a connected transport, the pipeline's response receiver, and the
/// backend port that serves them.
pub fn channel() -> (
    ChannelTransport,
    mpsc::UnboundedReceiver<ResponseFrame>,
    BackendPort,
) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport { tx: req_tx },
        resp_rx,
        BackendPort {
            requests: req_rx,
            responses: resp_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fingerprint, RowWindow};

    #[tokio::test]
    async fn test_request_reaches_backend_port() {
        let (transport, _responses, mut port) = channel();
        let req = FetchRequest::new(
            1,
            &RowWindow::new("df".into(), 0, 10),
            &Fingerprint("f".into()),
        );
        transport.send(&req).unwrap();
        assert_eq!(port.requests.recv().await, Some(req));
    }

    #[test]
    fn test_send_after_backend_gone_is_transport_error() {
        let (transport, _responses, port) = channel();
        drop(port);
        let req = FetchRequest::new(
            1,
            &RowWindow::new("df".into(), 0, 10),
            &Fingerprint("f".into()),
        );
        assert!(matches!(transport.send(&req), Err(GridError::Transport(_))));
    }
}
