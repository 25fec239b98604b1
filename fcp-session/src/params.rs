//! Service parameters exchanged at login

use fcp_codec::els::FcpServiceParams;
use fcp_core::{FcId, Wwn};
use serde::{Deserialize, Serialize};

/// Local port service parameters advertised in PLOGI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParams {
    pub port_id: FcId,
    pub wwpn: Wwn,
    pub wwnn: Wwn,
    /// Largest data field this port receives
    pub max_frame_size: u16,
    pub bb_credit: u16,
    /// Error detect timeout in milliseconds
    pub e_d_tov_ms: u32,
    /// Resource allocation timeout in milliseconds
    pub r_a_tov_ms: u32,
}

impl ServiceParams {
    /// Parameters with FC-FS default timers and a 2048-byte data field.
    pub fn new(port_id: FcId, wwpn: Wwn, wwnn: Wwn) -> Self {
        Self {
            port_id,
            wwpn,
            wwnn,
            max_frame_size: 2048,
            bb_credit: 10,
            e_d_tov_ms: 2_000,
            r_a_tov_ms: 10_000,
        }
    }

    pub fn with_max_frame_size(mut self, size: u16) -> Self {
        self.max_frame_size = size;
        self
    }
}

/// Identity of a logged-in remote port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePort {
    pub port_id: FcId,
    pub wwpn: Wwn,
    pub wwnn: Wwn,
}

/// FCP parameters negotiated by PRLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FcpParams {
    /// Sequence-level recovery (REC / SRR) is available
    pub retry: bool,
    pub confirm: bool,
    pub target: bool,
    pub initiator: bool,
    /// Largest data field both ends accept
    pub max_frame_size: u16,
    pub e_d_tov_ms: u32,
}

impl FcpParams {
    pub fn from_service_params(params: FcpServiceParams) -> Self {
        Self {
            retry: params.contains(FcpServiceParams::RETRY),
            confirm: params.contains(FcpServiceParams::CONF_COMPL),
            target: params.contains(FcpServiceParams::TARG_FCN),
            initiator: params.contains(FcpServiceParams::INIT_FCN),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fcp_params_from_page() {
        let params = FcpParams::from_service_params(
            FcpServiceParams::TARG_FCN | FcpServiceParams::RETRY,
        );
        assert!(params.retry);
        assert!(params.target);
        assert!(!params.initiator);
        assert!(!params.confirm);
    }
}
