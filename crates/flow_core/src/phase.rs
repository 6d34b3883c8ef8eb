use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowGroup {
    Idle,
    Payment,
    Trustline,
    Clearing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    #[default]
    Idle,
    PickingPaymentFrom,
    PickingPaymentTo,
    ConfirmPayment,
    PickingTrustlineFrom,
    PickingTrustlineTo,
    ConfirmTrustlineCreate,
    EditingTrustline,
    ConfirmClearing,
    ClearingPreview,
    ClearingRunning,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PickingPaymentFrom => "picking-payment-from",
            Self::PickingPaymentTo => "picking-payment-to",
            Self::ConfirmPayment => "confirm-payment",
            Self::PickingTrustlineFrom => "picking-trustline-from",
            Self::PickingTrustlineTo => "picking-trustline-to",
            Self::ConfirmTrustlineCreate => "confirm-trustline-create",
            Self::EditingTrustline => "editing-trustline",
            Self::ConfirmClearing => "confirm-clearing",
            Self::ClearingPreview => "clearing-preview",
            Self::ClearingRunning => "clearing-running",
        }
    }

    pub fn group(self) -> FlowGroup {
        match self {
            Self::Idle => FlowGroup::Idle,
            Self::PickingPaymentFrom | Self::PickingPaymentTo | Self::ConfirmPayment => {
                FlowGroup::Payment
            }
            Self::PickingTrustlineFrom
            | Self::PickingTrustlineTo
            | Self::ConfirmTrustlineCreate
            | Self::EditingTrustline => FlowGroup::Trustline,
            Self::ConfirmClearing | Self::ClearingPreview | Self::ClearingRunning => {
                FlowGroup::Clearing
            }
        }
    }

    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }

    pub fn is_payment(self) -> bool {
        self.group() == FlowGroup::Payment
    }

    pub fn is_trustline(self) -> bool {
        self.group() == FlowGroup::Trustline
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
