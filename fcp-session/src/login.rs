//! PLOGI / PRLI / LOGO login driver

use crate::error::{FcError, FcResult};
use crate::params::{FcpParams, RemotePort, ServiceParams};
use crate::session::Session;
use crate::state::SessionState;
use async_trait::async_trait;
use bytes::Bytes;
use fcp_codec::els::{
    ElsCommand, ElsReply, FC_SPP_RESP_ACK, FcpServiceParams, Logo, Plogi, Prli, RjtReason,
};
use fcp_core::FcId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sends one ELS request and returns the reply payload
///
/// The implementation owns exchange allocation and the per-request timeout.
#[async_trait]
pub trait ElsRequester: Send + Sync {
    async fn els_request(&self, d_id: FcId, payload: Bytes) -> FcResult<Bytes>;
}

/// Login retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginConfig {
    /// Extra attempts after the first one
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// FCP service parameters this initiator requests in PRLI
pub fn initiator_service_params() -> FcpServiceParams {
    FcpServiceParams::INIT_FCN | FcpServiceParams::RETRY
}

/// Failures worth another attempt: the remote was busy or did not answer.
fn worth_retry(err: &FcError) -> bool {
    match err {
        FcError::Timeout | FcError::ResourceExhausted(_) => true,
        FcError::Rejected { reason, .. } => matches!(
            RjtReason::from_u8(*reason),
            RjtReason::LogicalBusy | RjtReason::UnableToPerform
        ),
        _ => false,
    }
}

/// Run PLOGI then PRLI against the session's remote port, retrying busy or
/// silent remotes. On success the session holds the negotiated parameters
/// and is left in `PrliPending` for the caller to mark ready.
pub async fn login(
    session: &Session,
    requester: &dyn ElsRequester,
    config: &LoginConfig,
) -> FcResult<()> {
    let mut attempt = 0;
    loop {
        match login_once(session, requester).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < config.retries && worth_retry(&e) => {
                attempt += 1;
                log::info!(
                    "login to {} failed ({}), retry {}/{}",
                    session.remote_id(),
                    e,
                    attempt,
                    config.retries
                );
                session.transition(SessionState::Failed)?;
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn login_once(session: &Session, requester: &dyn ElsRequester) -> FcResult<()> {
    let local = *session.local();
    session.transition(SessionState::PlogiPending)?;
    let (remote, remote_frame_size, remote_e_d_tov) =
        port_login(session.remote_id(), &local, requester).await?;

    session.transition(SessionState::PrliPending)?;
    let mut fcp = process_login(session.remote_id(), requester).await?;
    fcp.max_frame_size = remote_frame_size.min(local.max_frame_size);
    fcp.e_d_tov_ms = if remote_e_d_tov == 0 {
        local.e_d_tov_ms
    } else {
        remote_e_d_tov.max(local.e_d_tov_ms)
    };
    log::info!(
        "logged in to {} ({}): retry={} confirm={} max_frame={}",
        remote.port_id,
        remote.wwpn,
        fcp.retry,
        fcp.confirm,
        fcp.max_frame_size
    );
    session.apply_login(remote, fcp);
    Ok(())
}

async fn port_login(
    d_id: FcId,
    local: &ServiceParams,
    requester: &dyn ElsRequester,
) -> FcResult<(RemotePort, u16, u32)> {
    let request = Plogi {
        wwpn: local.wwpn,
        wwnn: local.wwnn,
        bb_credit: local.bb_credit,
        max_frame_size: local.max_frame_size,
        e_d_tov: local.e_d_tov_ms,
    };
    let reply = requester
        .els_request(d_id, request.encode(ElsCommand::Plogi))
        .await?;
    let accept = Plogi::decode(&ElsReply::parse(reply)?.into_accept()?)?;
    let remote = RemotePort {
        port_id: d_id,
        wwpn: accept.wwpn,
        wwnn: accept.wwnn,
    };
    Ok((remote, accept.max_frame_size, accept.e_d_tov))
}

async fn process_login(d_id: FcId, requester: &dyn ElsRequester) -> FcResult<FcpParams> {
    let request = Prli::request(initiator_service_params());
    let reply = requester
        .els_request(d_id, request.encode(ElsCommand::Prli))
        .await?;
    let accept = Prli::decode(&ElsReply::parse(reply)?.into_accept()?)?;
    if accept.response != FC_SPP_RESP_ACK {
        return Err(FcError::Protocol(format!(
            "PRLI to {} answered with response code {:#x}",
            d_id, accept.response
        )));
    }
    let fcp = FcpParams::from_service_params(accept.params);
    if !fcp.target {
        return Err(FcError::Protocol(format!("{} is not an FCP target", d_id)));
    }
    Ok(fcp)
}

/// Send LOGO for the local port. A reject still ends the session locally.
pub async fn logout(session: &Session, requester: &dyn ElsRequester) -> FcResult<()> {
    let logo = Logo {
        s_id: session.local().port_id,
        wwpn: session.local().wwpn,
    };
    let reply = requester.els_request(session.remote_id(), logo.encode()).await?;
    if let ElsReply::Reject(rjt) = ElsReply::parse(reply)? {
        log::warn!(
            "LOGO to {} rejected: {:?} ({:#x})",
            session.remote_id(),
            rjt.reason,
            rjt.explanation
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcp_codec::els::{LsRjt, ls_acc};
    use fcp_core::Wwn;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replies from a script, records requests.
    struct Scripted {
        replies: Mutex<VecDeque<FcResult<Bytes>>>,
        requests: Mutex<Vec<u8>>,
    }

    impl Scripted {
        fn new(replies: Vec<FcResult<Bytes>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ElsRequester for Scripted {
        async fn els_request(&self, _d_id: FcId, payload: Bytes) -> FcResult<Bytes> {
            self.requests.lock().push(payload[0]);
            self.replies.lock().pop_front().unwrap_or(Err(FcError::Timeout))
        }
    }

    fn session() -> Session {
        let local = ServiceParams::new(FcId::new(0x010001).unwrap(), Wwn::new(1), Wwn::new(2));
        Session::new(local, FcId::new(0x020002).unwrap())
    }

    fn plogi_acc(frame_size: u16) -> Bytes {
        Plogi {
            wwpn: Wwn::new(0x50),
            wwnn: Wwn::new(0x51),
            bb_credit: 8,
            max_frame_size: frame_size,
            e_d_tov: 2000,
        }
        .encode(ElsCommand::LsAcc)
    }

    fn prli_acc(params: FcpServiceParams) -> Bytes {
        Prli {
            establish_image_pair: true,
            response: FC_SPP_RESP_ACK,
            params,
        }
        .encode(ElsCommand::LsAcc)
    }

    fn quick() -> LoginConfig {
        LoginConfig {
            retries: 2,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_login_negotiates() {
        let s = session();
        let target = Scripted::new(vec![
            Ok(plogi_acc(1024)),
            Ok(prli_acc(FcpServiceParams::TARG_FCN | FcpServiceParams::RETRY)),
        ]);
        login(&s, &target, &quick()).await.unwrap();

        assert_eq!(*target.requests.lock(), vec![0x03, 0x20]);
        assert_eq!(s.state(), SessionState::PrliPending);
        assert!(s.rec_supported());
        assert_eq!(s.max_payload(), 1024);
        assert_eq!(s.remote_port().unwrap().wwpn, Wwn::new(0x50));
    }

    #[tokio::test]
    async fn test_login_retries_busy() {
        let s = session();
        let busy = LsRjt::new(RjtReason::LogicalBusy, 0).encode();
        let target = Scripted::new(vec![
            Ok(busy),
            Ok(plogi_acc(2048)),
            Ok(prli_acc(FcpServiceParams::TARG_FCN)),
        ]);
        login(&s, &target, &quick()).await.unwrap();
        assert_eq!(*target.requests.lock(), vec![0x03, 0x03, 0x20]);
        assert!(!s.rec_supported());
    }

    #[tokio::test]
    async fn test_login_rejects_non_target() {
        let s = session();
        let target = Scripted::new(vec![
            Ok(plogi_acc(2048)),
            Ok(prli_acc(FcpServiceParams::INIT_FCN)),
        ]);
        let err = login(&s, &target, &quick()).await.unwrap_err();
        assert!(matches!(err, FcError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_login_gives_up_after_retries() {
        let s = session();
        let target = Scripted::new(vec![]);
        let err = login(&s, &target, &quick()).await.unwrap_err();
        assert!(matches!(err, FcError::Timeout));
        assert_eq!(target.requests.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_logout_tolerates_reject() {
        let s = session();
        let target = Scripted::new(vec![Ok(LsRjt::new(RjtReason::UnableToPerform, 0).encode())]);
        logout(&s, &target).await.unwrap();
        let target = Scripted::new(vec![Ok(ls_acc())]);
        logout(&s, &target).await.unwrap();
        assert_eq!(*target.requests.lock(), vec![0x05]);
    }
}
