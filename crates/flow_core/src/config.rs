use shared::domain::EquivalentCode;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;
pub const DEFAULT_HISTORY_VISIBLE: usize = 8;
pub const DEFAULT_EQUIVALENT: &str = "UAH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    SingleHop,
    MultiHop { max_hops: u8 },
}

impl RoutingMode {
    pub fn from_max_hops(max_hops: u8) -> Self {
        if max_hops <= 1 {
            Self::SingleHop
        } else {
            Self::MultiHop { max_hops }
        }
    }

    pub fn max_hops(self) -> u8 {
        match self {
            Self::SingleHop => 1,
            Self::MultiHop { max_hops } => max_hops,
        }
    }

    pub fn is_multi_hop(self) -> bool {
        matches!(self, Self::MultiHop { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub equivalent: EquivalentCode,
    pub routing: RoutingMode,
    pub history_capacity: usize,
    pub history_visible: usize,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            equivalent: EquivalentCode::new(DEFAULT_EQUIVALENT),
            routing: RoutingMode::SingleHop,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_visible: DEFAULT_HISTORY_VISIBLE,
        }
    }
}
