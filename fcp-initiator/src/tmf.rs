//! Task management and resets
//!
//! A LUN or target reset is a TMF FCP_CMND. Once the target confirms it,
//! every other command in scope is finished locally with `AbortedByReset`;
//! commands the adapter is running get a terminate request first and the
//! reset fails if any of them is still pending after `term_timeout`.

use crate::command::CompletionCode;
use crate::events::HostEventKind;
use crate::hw::HwOwner;
use crate::initiator::FcpInitiator;
use crate::recovery::abort_settled;
use fcp_codec::fcp::{FcpCmnd, FcpRsp, TmFlags, rsp_code};
use fcp_codec::{FcType, RCtl};
use fcp_core::{FcError, FcId, FcResult, ScsiLun, ScsiStatus, SlotHandle, Wwn};
use fcp_transport::{HwRequest, HwStatus, ItmfOp};
use futures::future::join_all;
use tokio::sync::oneshot;

/// Commands affected by a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    Lun(FcId, ScsiLun),
    Target(FcId),
    All,
}

impl ResetScope {
    pub fn contains(&self, d_id: FcId, lun: ScsiLun) -> bool {
        match *self {
            ResetScope::Lun(target, l) => target == d_id && l == lun,
            ResetScope::Target(target) => target == d_id,
            ResetScope::All => true,
        }
    }
}

impl FcpInitiator {
    /// Reset one logical unit.
    pub async fn lun_reset(&self, d_id: FcId, lun: ScsiLun) -> FcResult<()> {
        let wwpn = self.remote_wwpn(d_id)?;
        log::info!("LUN reset {}/{}", d_id, lun.to_u64());
        self.task_management(d_id, lun, TmFlags::LUN_RESET, ItmfOp::LunReset)
            .await?;
        self.cleanup_scope(ResetScope::Lun(d_id, lun)).await?;
        self.luns.clear(d_id, lun);
        self.stats.increment_resets();
        self.events.post(HostEventKind::Reset, d_id, wwpn);
        Ok(())
    }

    /// Reset every logical unit behind a target port.
    pub async fn target_reset(&self, d_id: FcId) -> FcResult<()> {
        let wwpn = self.remote_wwpn(d_id)?;
        log::info!("target reset {}", d_id);
        self.task_management(
            d_id,
            ScsiLun::from_u64(0),
            TmFlags::TARGET_RESET,
            ItmfOp::TargetReset,
        )
        .await?;
        self.cleanup_scope(ResetScope::Target(d_id)).await?;
        self.luns.clear_target(d_id);
        self.stats.increment_resets();
        self.events.post(HostEventKind::Reset, d_id, wwpn);
        Ok(())
    }

    /// Flush everything in flight, reset the adapter firmware when there is
    /// one, and log in to every known port again.
    pub async fn host_reset(&self) -> FcResult<()> {
        log::warn!("host reset on {}", self.local.port_id);
        let firmware = match &self.hw {
            Some(hw) => {
                let (tx, rx) = oneshot::channel();
                let tag = hw.start(HwOwner::Waiter(tx), HwRequest::FirmwareReset)?;
                match tokio::time::timeout(self.config.host_reset_timeout(), rx).await {
                    Ok(Ok(event)) if event.status == HwStatus::Success => Ok(()),
                    Ok(Ok(event)) => Err(FcError::Protocol(format!(
                        "firmware reset failed: {:?}",
                        event.status
                    ))),
                    Ok(Err(_)) => Err(FcError::Closed),
                    Err(_) => {
                        hw.release(tag);
                        Err(FcError::Timeout)
                    }
                }
            }
            None => Ok(()),
        };

        let flushed = self.complete_where(|_| true, CompletionCode::HostReset);
        self.fail_requests();
        self.exchanges.drain();
        if let Some(hw) = &self.hw {
            hw.drain_except(None);
        }
        log::info!("host reset flushed {} commands", flushed);

        for session in self.sessions.sessions() {
            self.sessions.mark_ready(&session, false);
            self.start_login(&session);
        }
        self.stats.increment_resets();
        self.events
            .post(HostEventKind::Reset, self.local.port_id, self.local.wwpn);
        firmware
    }

    fn remote_wwpn(&self, d_id: FcId) -> FcResult<Wwn> {
        let session = self.ready_session(d_id)?;
        Ok(session.remote_port().map(|r| r.wwpn).unwrap_or_default())
    }

    async fn task_management(
        &self,
        d_id: FcId,
        lun: ScsiLun,
        flags: TmFlags,
        op: ItmfOp,
    ) -> FcResult<()> {
        let timeout = self.config.tmf_timeout();
        if let Some(hw) = &self.hw {
            let (tx, rx) = oneshot::channel();
            let tag = hw.start(
                HwOwner::Waiter(tx),
                HwRequest::Itmf {
                    d_id,
                    lun,
                    op,
                    target_tag: None,
                },
            )?;
            return match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(event)) if event.status == HwStatus::Success => Ok(()),
                Ok(Ok(event)) => Err(FcError::Protocol(format!(
                    "{:?} failed: {:?}",
                    op, event.status
                ))),
                Ok(Err(_)) => Err(FcError::Closed),
                Err(_) => {
                    hw.release(tag);
                    Err(FcError::Timeout)
                }
            };
        }

        let cmnd = FcpCmnd::task_management(lun, flags);
        let reply = self
            .exchange_request(d_id, RCtl::UnsolCmd, FcType::Fcp, cmnd.encode(), timeout)
            .await?;
        if reply.r_ctl() != RCtl::CmdStatus {
            return Err(FcError::Protocol(format!(
                "unexpected {:?} in reply to {:?}",
                reply.r_ctl(),
                flags
            )));
        }
        let rsp = FcpRsp::decode(&reply.payload)?;
        match rsp.rsp_code {
            None | Some(rsp_code::TMF_COMPLETE) if rsp.status == ScsiStatus::Good => Ok(()),
            Some(code) => {
                log::warn!("{:?} to {} failed with response code {:#04x}", flags, d_id, code);
                Err(FcError::Protocol(format!(
                    "task management response code {:#04x}",
                    code
                )))
            }
            None => Err(FcError::Protocol(format!(
                "task management status {:?}",
                rsp.status
            ))),
        }
    }

    /// Finish every command in `scope` after a successful reset.
    pub(crate) async fn cleanup_scope(&self, scope: ResetScope) -> FcResult<()> {
        let in_scope = self
            .commands
            .select(|c| scope.contains(c.d_id(), c.lun()));
        let (offloaded, software): (Vec<SlotHandle>, Vec<SlotHandle>) = in_scope
            .into_iter()
            .partition(|h| self.commands.with(*h, |c| c.hw_tag.is_some()) == Some(true));

        let reset = software
            .into_iter()
            .filter(|h| self.complete(*h, CompletionCode::AbortedByReset))
            .count();

        let waits: Vec<_> = offloaded
            .iter()
            .filter_map(|h| {
                self.start_abort(*h, CompletionCode::AbortedByReset, ItmfOp::TerminateTask)
            })
            .map(abort_settled)
            .collect();
        let terminating = waits.len();
        let settled =
            tokio::time::timeout(self.config.term_timeout(), join_all(waits)).await;

        log::info!(
            "{:?}: {} commands reset, {} terminated",
            scope,
            reset,
            terminating
        );
        let codes = match settled {
            Ok(codes) => codes,
            Err(_) => {
                let pending = offloaded
                    .iter()
                    .filter(|h| self.commands.contains(**h))
                    .count();
                if pending > 0 {
                    log::warn!("{} commands still pending {:?} after terminate", pending, scope);
                    return Err(FcError::Timeout);
                }
                Vec::new()
            }
        };
        let failed = codes
            .iter()
            .filter(|code| **code == Some(CompletionCode::TmfFailed))
            .count();
        if failed > 0 {
            log::warn!("{} of {} terminates failed in {:?}", failed, terminating, scope);
            return Err(FcError::TmfFailed(format!(
                "{} commands not terminated in {:?}",
                failed, scope
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_membership() {
        let a = FcId::new(0x020200).unwrap();
        let b = FcId::new(0x030300).unwrap();
        let lun0 = ScsiLun::from_u64(0);
        let lun1 = ScsiLun::from_u64(1);

        assert!(ResetScope::Lun(a, lun0).contains(a, lun0));
        assert!(!ResetScope::Lun(a, lun0).contains(a, lun1));
        assert!(ResetScope::Target(a).contains(a, lun1));
        assert!(!ResetScope::Target(a).contains(b, lun0));
        assert!(ResetScope::All.contains(b, lun1));
    }
}
