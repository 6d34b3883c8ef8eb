use shared::domain::{EdgeKey, ParticipantId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayKind {
    NodeCard(ParticipantId),
    EdgeCard(EdgeKey),
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeStage {
    Overlay,
    ArmedConfirmation,
    Flow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscapeResolution {
    OverlayClosed(OverlayKind),
    ConfirmationDisarmed,
    FlowCancelled,
    Unhandled,
}

pub trait EscapeTarget {
    fn close_top_overlay(&mut self) -> Option<OverlayKind>;
    fn disarm_confirmation(&mut self) -> bool;
    fn cancel_flow(&mut self) -> bool;
}

#[derive(Debug, Clone)]
pub struct EscapeChain {
    stages: Vec<EscapeStage>,
}

impl Default for EscapeChain {
    fn default() -> Self {
        Self::new(vec![
            EscapeStage::Overlay,
            EscapeStage::ArmedConfirmation,
            EscapeStage::Flow,
        ])
    }
}

impl EscapeChain {
    pub fn new(stages: Vec<EscapeStage>) -> Self {
        Self { stages }
    }

    pub fn dispatch(&self, target: &mut impl EscapeTarget) -> EscapeResolution {
        for stage in &self.stages {
            let resolution = match stage {
                EscapeStage::Overlay => target
                    .close_top_overlay()
                    .map(EscapeResolution::OverlayClosed),
                EscapeStage::ArmedConfirmation => target
                    .disarm_confirmation()
                    .then_some(EscapeResolution::ConfirmationDisarmed),
                EscapeStage::Flow => target
                    .cancel_flow()
                    .then_some(EscapeResolution::FlowCancelled),
            };
            if let Some(resolution) = resolution {
                return resolution;
            }
        }
        EscapeResolution::Unhandled
    }
}
