use crate::bindings::*;

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Just created, not yet initialized.
    Reset,

    /// Initialized, not yet ready to receive.
    Init,

    /// Ready to receive.
    Rtr,

    /// Ready to send.
    Rts,

    /// Send queue drained.
    Sqd,

    /// Send queue error.
    Sqe,

    /// Errored out.
    Error,

    /// Unknown or unrecognized state.
    Unknown,
}

impl From<u32> for QpState {
    fn from(state: u32) -> Self {
        match state {
            ibv_qp_state::IBV_QPS_RESET => QpState::Reset,
            ibv_qp_state::IBV_QPS_INIT => QpState::Init,
            ibv_qp_state::IBV_QPS_RTR => QpState::Rtr,
            ibv_qp_state::IBV_QPS_RTS => QpState::Rts,
            ibv_qp_state::IBV_QPS_SQD => QpState::Sqd,
            ibv_qp_state::IBV_QPS_SQE => QpState::Sqe,
            ibv_qp_state::IBV_QPS_ERR => QpState::Error,
            _ => QpState::Unknown,
        }
    }
}
