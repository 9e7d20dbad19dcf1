use crate::tunnel::TunnelManager;

pub struct State {
    pub manager: TunnelManager,
}
