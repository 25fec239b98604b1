//! Software link port
//!
//! Moves frames between a byte-oriented link and the initiator: inbound
//! bytes are decoded and handed to [`FcpInitiator::recv_frame`], frames the
//! engine queued on its [`QueuedSink`] are encoded and written out. When the
//! link closes the initiator is told the link went down.

use crate::builder::InitiatorBuilder;
use crate::events::HostEventReceiver;
use crate::initiator::FcpInitiator;
use bytes::Bytes;
use fcp_codec::{FcFrame, FrameCodec};
use fcp_core::FcResult;
use fcp_transport::{LinkAccessor, QueuedSink};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum Step {
    Inbound(FcResult<Option<Bytes>>),
    Outbound(Option<FcFrame>),
}

/// A running link pump
pub struct LinkPort {
    task: JoinHandle<FcResult<()>>,
}

impl LinkPort {
    /// Start pumping between `link` and `initiator`.
    ///
    /// # Arguments
    /// * `link` - Link carrying encoded frames
    /// * `codec` - Frame encapsulation used on the link
    /// * `initiator` - Engine receiving inbound frames
    /// * `outbound` - Receiving end of the initiator's [`QueuedSink`]
    pub fn spawn<L>(
        mut link: L,
        codec: Arc<dyn FrameCodec>,
        initiator: Arc<FcpInitiator>,
        mut outbound: mpsc::Receiver<FcFrame>,
    ) -> Self
    where
        L: LinkAccessor + 'static,
    {
        let task = tokio::spawn(async move {
            let result = loop {
                let step = tokio::select! {
                    inbound = link.recv() => Step::Inbound(inbound),
                    frame = outbound.recv() => Step::Outbound(frame),
                };
                match step {
                    Step::Inbound(Ok(Some(bytes))) => match codec.decode(&bytes) {
                        Ok(frame) => initiator.recv_frame(frame),
                        Err(e) => log::warn!("dropping undecodable frame: {}", e),
                    },
                    Step::Inbound(Ok(None)) => {
                        log::info!("link closed by peer");
                        break Ok(());
                    }
                    Step::Inbound(Err(e)) => break Err(e),
                    Step::Outbound(Some(frame)) => {
                        let bytes = match codec.encode(&frame) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                log::error!("cannot encode {:?} frame: {}", frame.r_ctl(), e);
                                continue;
                            }
                        };
                        if let Err(e) = link.send(bytes).await {
                            break Err(e);
                        }
                    }
                    Step::Outbound(None) => {
                        let _ = link.close().await;
                        break Ok(());
                    }
                }
            };
            if let Err(e) = &result {
                log::error!("link failed: {}", e);
            }
            initiator.link_down();
            result
        });
        Self { task }
    }

    /// Build an initiator around a [`QueuedSink`] and attach it to `link`.
    ///
    /// The link is reported up once the pump runs, which starts login to
    /// every port already in the session table.
    pub fn connect<L>(
        link: L,
        codec: Arc<dyn FrameCodec>,
        builder: InitiatorBuilder,
        queue_depth: usize,
    ) -> FcResult<(Arc<FcpInitiator>, HostEventReceiver, LinkPort)>
    where
        L: LinkAccessor + 'static,
    {
        let (sink, outbound) = QueuedSink::channel(queue_depth);
        let (initiator, events) = builder.sink(Arc::new(sink)).build()?;
        let port = Self::spawn(link, codec, initiator.clone(), outbound);
        initiator.link_up();
        Ok((initiator, events, port))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the pump to stop.
    pub async fn join(self) -> FcResult<()> {
        self.task.await.map_err(|e| {
            fcp_core::FcError::Io(std::io::Error::other(format!("link task: {}", e)))
        })?
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}
