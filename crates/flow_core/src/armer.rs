#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisarmSignal {
    PhaseChanged,
    SelectionChanged,
    BusyStarted,
    Escape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmStep {
    Armed,
    Fire,
}

#[derive(Debug, Clone)]
pub struct DestructiveConfirmArmer {
    armed: bool,
    disarm_on: Vec<DisarmSignal>,
}

impl DestructiveConfirmArmer {
    pub fn new(disarm_on: impl IntoIterator<Item = DisarmSignal>) -> Self {
        Self {
            armed: false,
            disarm_on: disarm_on.into_iter().collect(),
        }
    }

    pub fn for_trustline_close() -> Self {
        Self::new([
            DisarmSignal::PhaseChanged,
            DisarmSignal::SelectionChanged,
            DisarmSignal::BusyStarted,
            DisarmSignal::Escape,
        ])
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn press(&mut self) -> ArmStep {
        if self.armed {
            self.armed = false;
            ArmStep::Fire
        } else {
            self.armed = true;
            ArmStep::Armed
        }
    }

    pub fn signal(&mut self, signal: DisarmSignal) -> bool {
        if !self.armed || !self.disarm_on.contains(&signal) {
            return false;
        }
        self.armed = false;
        true
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}
