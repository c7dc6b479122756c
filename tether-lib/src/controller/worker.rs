use std::sync::Arc;

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{trace, warn};

use crate::{
    signaling::{Candidate, SdpKind, SessionDescription},
    transport::{Transport, TransportError},
};

use super::session::{SessionInput, Tagged};

/// Transport calls requested by the negotiator. They run one at a time in request order, so a
/// candidate is never applied before the remote description it follows.
#[derive(Debug)]
pub(crate) enum TransportOp {
    CreateChannel,
    CreateLocalDescription(SdpKind),
    SetRemoteDescription(SessionDescription),
    AddRemoteCandidate(Candidate),
}

impl TransportOp {
    /// `None` when a failure only affects this one op.
    fn failure_notice(&self) -> Option<&'static str> {
        match self {
            Self::CreateChannel | Self::CreateLocalDescription(SdpKind::Offer) => {
                Some("Failed to create connection offer")
            }
            Self::CreateLocalDescription(SdpKind::Answer) => Some("Failed to handle connection offer"),
            Self::SetRemoteDescription(desc) => Some(match desc.kind {
                SdpKind::Offer => "Failed to handle connection offer",
                SdpKind::Answer => "Failed to handle connection answer",
            }),
            Self::AddRemoteCandidate(_) => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum OpOutcome {
    LocalDescriptionReady(SessionDescription),
    RemoteDescriptionInstalled,
    Failed {
        notice: &'static str,
        error: TransportError,
    },
}

async fn execute(
    transport: &dyn Transport,
    op: TransportOp,
) -> Result<Option<OpOutcome>, TransportError> {
    match op {
        TransportOp::CreateChannel => {
            transport.create_channel().await?;
            Ok(None)
        }
        TransportOp::CreateLocalDescription(kind) => {
            let desc = match kind {
                SdpKind::Offer => transport.create_offer().await?,
                SdpKind::Answer => transport.create_answer().await?,
            };
            transport.set_local_description(desc.clone()).await?;
            Ok(Some(OpOutcome::LocalDescriptionReady(desc)))
        }
        TransportOp::SetRemoteDescription(desc) => {
            transport.set_remote_description(desc).await?;
            Ok(Some(OpOutcome::RemoteDescriptionInstalled))
        }
        TransportOp::AddRemoteCandidate(candidate) => {
            transport.add_remote_candidate(candidate).await?;
            Ok(None)
        }
    }
}

pub(crate) fn spawn_op_worker(
    transport: Arc<dyn Transport>,
    generation: u64,
    inputs: mpsc::UnboundedSender<Tagged>,
) -> (mpsc::UnboundedSender<TransportOp>, JoinHandle<()>) {
    let (ops_tx, mut ops_rx) = mpsc::unbounded_channel::<TransportOp>();
    let task = tokio::spawn(async move {
        while let Some(op) = ops_rx.recv().await {
            trace!("transport op {:?}", op);
            let notice = op.failure_notice();
            let outcome = match execute(transport.as_ref(), op).await {
                Ok(None) => continue,
                Ok(Some(outcome)) => outcome,
                Err(error) => {
                    let Some(notice) = notice else {
                        warn!("failed to add remote candidate: {}", error);
                        continue;
                    };
                    OpOutcome::Failed { notice, error }
                }
            };
            let failed = matches!(outcome, OpOutcome::Failed { .. });
            let sent = inputs.send(Tagged::new(generation, SessionInput::Op(outcome)));
            if sent.is_err() || failed {
                break;
            }
        }
        trace!("transport worker of session {} finished", generation);
    });
    (ops_tx, task)
}

/// Drains outgoing chat payloads into the transport in queue order.
pub(crate) fn spawn_writer(
    transport: Arc<dyn Transport>,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    generation: u64,
    inputs: mpsc::UnboundedSender<Tagged>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = outgoing.recv().await {
            let Err(err) = transport.send(data).await else {
                continue;
            };
            if inputs
                .send(Tagged::new(generation, SessionInput::SendFailed(err)))
                .is_err()
            {
                break;
            }
        }
        trace!("writer of session {} finished", generation);
    })
}
