use shared::{
    domain::{EdgeKey, ParticipantId},
    protocol::{ClearingCycle, ClearingResult},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenPoint {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearingSummary {
    pub cycles: Vec<ClearingCycle>,
    pub total_cleared: String,
}

impl From<ClearingResult> for ClearingSummary {
    fn from(value: ClearingResult) -> Self {
        Self {
            cycles: value.cycles,
            total_cleared: value.total_cleared,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionState {
    pub from_id: Option<ParticipantId>,
    pub to_id: Option<ParticipantId>,
    pub selected_edge_key: Option<EdgeKey>,
    pub edge_anchor: Option<ScreenPoint>,
    pub error: Option<String>,
    pub notice: Option<String>,
    pub last_clearing: Option<ClearingSummary>,
}

impl SelectionState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn pair(&self) -> Option<(&ParticipantId, &ParticipantId)> {
        match (&self.from_id, &self.to_id) {
            (Some(from), Some(to)) => Some((from, to)),
            _ => None,
        }
    }

    /// A sender equal to the current recipient clears the recipient.
    pub fn set_from(&mut self, from_id: Option<ParticipantId>) -> bool {
        if self.from_id == from_id {
            return false;
        }
        if from_id.is_some() && from_id == self.to_id {
            self.to_id = None;
        }
        self.from_id = from_id;
        self.drop_edge();
        true
    }

    pub fn set_to(&mut self, to_id: Option<ParticipantId>) -> bool {
        if self.to_id == to_id {
            return false;
        }
        self.to_id = to_id;
        if self.to_id.is_some() {
            self.notice = None;
        }
        self.drop_edge();
        true
    }

    pub fn pick_edge(&mut self, anchor: Option<ScreenPoint>) {
        self.selected_edge_key = self.pair().map(|(from, to)| EdgeKey::new(from, to));
        self.edge_anchor = anchor;
    }

    fn drop_edge(&mut self) {
        self.selected_edge_key = None;
        self.edge_anchor = None;
    }
}
