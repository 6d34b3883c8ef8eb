//! Phase machine sequencing the payment, trustline, and clearing flows.

use std::{sync::Arc, time::Instant};

use shared::{
    domain::{ActionKind, ActionOutcome, EquivalentCode, ParticipantId, TrustlineStatus},
    protocol::{ParticipantSummary, TrustlineSummary},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    amount::{check_payment_amount, parse_capacity, parse_positive_amount, AmountCheck},
    armer::{ArmStep, DestructiveConfirmArmer, DisarmSignal},
    capability::{CapabilityCache, CapabilityKey, CapabilityState},
    config::{FlowOptions, RoutingMode},
    escape::{EscapeChain, EscapeResolution, EscapeTarget, OverlayKind},
    gateway::{ActionGateway, GatewayError, GatewayResult},
    history::{HistoryEntry, HistoryLog},
    notice::{Notice, NoticeLevel},
    phase::Phase,
    selection::{ClearingSummary, ScreenPoint, SelectionState},
};

const BUSY_MESSAGE: &str = "another action is in progress";
const ACTIONS_DISABLED_MESSAGE: &str = "actions are disabled by the backend";
const MISSING_SELECTION_MESSAGE: &str = "select both participants first";
const SAME_PARTICIPANT_MESSAGE: &str = "pick a different participant";
const UNREACHABLE_RECIPIENT_MESSAGE: &str = "recipient is not reachable from the selected sender";
const RECIPIENT_UNAVAILABLE_NOTICE: &str = "recipient no longer available";
const TRUSTLINE_EXISTS_MESSAGE: &str = "a trustline between these participants already exists";
const TRUSTLINE_IN_USE_MESSAGE: &str = "trustline has outstanding debt and cannot be closed";
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What an operation did. Guard failures are `Ignored`, never errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    Ignored,
    Rejected(String),
    Advanced,
    Armed,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum FlowEvent {
    PhaseChanged { from: Phase, to: Phase },
    SelectionChanged(SelectionState),
    BusyChanged(bool),
    CapabilitiesUpdated {
        key: CapabilityKey,
        state: CapabilityState,
    },
    HistoryRecorded(HistoryEntry),
    Notice(Notice),
}

#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    pub phase: Phase,
    pub selection: SelectionState,
    pub busy: bool,
    pub actions_disabled: bool,
    pub equivalent: EquivalentCode,
    pub capabilities: Option<CapabilityState>,
    pub history: Vec<HistoryEntry>,
    pub notice: Option<Notice>,
    pub payment_amount: String,
    pub payment_check: Option<AmountCheck>,
    pub can_confirm_payment: bool,
    pub close_armed: bool,
    pub full_editor: bool,
    pub overlay: Option<OverlayKind>,
}

type TransitionHook = fn(&mut FlowState, Phase, Phase);

const TRUSTLINE_EXIT_HOOKS: &[TransitionHook] = &[leave_trustline_group];
const IDLE_ENTRY_HOOKS: &[TransitionHook] = &[return_to_rest];
const CLEARING_RUNNING_ENTRY_HOOKS: &[TransitionHook] = &[forget_last_clearing];

fn exit_hooks(phase: Phase) -> &'static [TransitionHook] {
    if phase.is_trustline() {
        TRUSTLINE_EXIT_HOOKS
    } else {
        &[]
    }
}

fn entry_hooks(phase: Phase) -> &'static [TransitionHook] {
    match phase {
        Phase::Idle => IDLE_ENTRY_HOOKS,
        Phase::ClearingRunning => CLEARING_RUNNING_ENTRY_HOOKS,
        _ => &[],
    }
}

fn leave_trustline_group(state: &mut FlowState, _from: Phase, to: Phase) {
    if !to.is_trustline() {
        state.full_editor = false;
    }
}

fn return_to_rest(state: &mut FlowState, _from: Phase, _to: Phase) {
    state.selection.reset();
    state.payment_amount.clear();
    state.capabilities.invalidate();
    state.close_armer.disarm();
}

fn forget_last_clearing(state: &mut FlowState, _from: Phase, _to: Phase) {
    state.selection.last_clearing = None;
}

struct FlowState {
    phase: Phase,
    /// Bumped on every transition; settling calls compare against it.
    epoch: u64,
    selection: SelectionState,
    busy: bool,
    actions_disabled: bool,
    equivalent: EquivalentCode,
    routing: RoutingMode,
    capabilities: CapabilityCache,
    history: HistoryLog,
    close_armer: DestructiveConfirmArmer,
    overlays: Vec<OverlayKind>,
    payment_amount: String,
    full_editor: bool,
    participants: Vec<ParticipantSummary>,
    trustlines: Vec<TrustlineSummary>,
    notice: Option<Notice>,
    events: broadcast::Sender<FlowEvent>,
}

impl FlowState {
    fn emit(&self, event: FlowEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&mut self, to: Phase) -> bool {
        let from = self.phase;
        if from == to {
            return false;
        }

        for hook in exit_hooks(from) {
            hook(self, from, to);
        }
        self.phase = to;
        self.epoch += 1;
        self.selection.error = None;
        self.close_armer.signal(DisarmSignal::PhaseChanged);
        for hook in entry_hooks(to) {
            hook(self, from, to);
        }

        info!(from = %from, to = %to, "flow: phase transition");
        self.emit(FlowEvent::PhaseChanged { from, to });
        true
    }

    fn selection_changed(&mut self) {
        self.close_armer.signal(DisarmSignal::SelectionChanged);
        self.emit(FlowEvent::SelectionChanged(self.selection.clone()));
    }

    fn set_from(&mut self, from_id: Option<ParticipantId>) -> bool {
        if !self.selection.set_from(from_id) {
            return false;
        }
        self.capabilities.invalidate();
        self.selection_changed();
        true
    }

    fn set_to(&mut self, to_id: Option<ParticipantId>) -> bool {
        if !self.selection.set_to(to_id) {
            return false;
        }
        self.selection_changed();
        true
    }

    fn realign_payment_phase(&mut self) {
        if !self.phase.is_payment() {
            return;
        }
        let target = match (&self.selection.from_id, &self.selection.to_id) {
            (None, _) => Phase::PickingPaymentFrom,
            (Some(_), None) => Phase::PickingPaymentTo,
            (Some(_), Some(_)) => Phase::ConfirmPayment,
        };
        self.transition(target);
    }

    fn set_busy(&mut self, busy: bool) {
        if self.busy == busy {
            return;
        }
        self.busy = busy;
        if busy {
            self.close_armer.signal(DisarmSignal::BusyStarted);
        }
        self.emit(FlowEvent::BusyChanged(busy));
    }

    fn begin_mutation(&mut self) -> u64 {
        self.set_busy(true);
        self.epoch
    }

    fn finish_mutation<T>(
        &mut self,
        kind: ActionKind,
        summary: String,
        result: &GatewayResult<T>,
        success_text: &str,
    ) {
        self.set_busy(false);
        match result {
            Ok(_) => {
                info!(kind = kind.label(), summary = %summary, "flow: action completed");
                self.record(HistoryEntry::new(kind, summary, ActionOutcome::Ok));
                self.show_notice(NoticeLevel::Success, success_text);
            }
            Err(err) => {
                warn!(kind = kind.label(), status = ?err.status, "flow: action failed: {err}");
                self.note_gateway_failure(err);
                self.record(HistoryEntry::new(
                    kind,
                    format!("{summary}: {}", err.message),
                    ActionOutcome::Error,
                ));
                self.show_notice(NoticeLevel::Error, err.message.clone());
            }
        }
    }

    fn fail_in_place(&mut self, epoch: u64, err: &GatewayError) {
        if self.epoch == epoch {
            self.selection.error = Some(err.message.clone());
        }
    }

    fn reject(&mut self, message: impl Into<String>) -> FlowOutcome {
        let message = message.into();
        debug!(phase = %self.phase, "flow: rejected locally: {message}");
        self.selection.error = Some(message.clone());
        FlowOutcome::Rejected(message)
    }

    fn note_gateway_failure(&mut self, err: &GatewayError) {
        if err.is_actions_disabled() && !self.actions_disabled {
            warn!("flow: backend reports actions disabled");
            self.actions_disabled = true;
        }
    }

    fn record(&mut self, entry: HistoryEntry) {
        self.history.record(entry.clone());
        self.emit(FlowEvent::HistoryRecorded(entry));
    }

    fn show_notice(&mut self, level: NoticeLevel, text: impl Into<String>) {
        let notice = Notice::new(level, text);
        self.notice = Some(notice.clone());
        self.emit(FlowEvent::Notice(notice));
    }

    fn distinct_pair(&self) -> Option<(ParticipantId, ParticipantId)> {
        self.selection
            .pair()
            .filter(|(from, to)| from != to)
            .map(|(from, to)| (from.clone(), to.clone()))
    }

    fn find_trustline(&self, from: &ParticipantId, to: &ParticipantId) -> Option<&TrustlineSummary> {
        self.trustlines.iter().find(|line| {
            line.from_id == *from && line.to_id == *to && line.status != TrustlineStatus::Closed
        })
    }

    fn direct_capacity(&self, from: &ParticipantId, to: &ParticipantId) -> Option<String> {
        self.find_trustline(to, from).map(|line| line.available.clone())
    }

    fn capability_for(&self, from: &ParticipantId) -> Option<&CapabilityState> {
        let key = CapabilityKey::new(self.equivalent.clone(), from.clone());
        if self.capabilities.active_key() == Some(&key) {
            self.capabilities.state()
        } else {
            None
        }
    }

    fn payment_check(&self) -> Option<AmountCheck> {
        if self.phase != Phase::ConfirmPayment {
            return None;
        }
        let (from, to) = self.distinct_pair()?;
        let capacity = self.direct_capacity(&from, &to);
        Some(check_payment_amount(
            &self.payment_amount,
            capacity.as_deref(),
            self.routing,
        ))
    }

    fn display_name(&self, id: &ParticipantId) -> String {
        self.participants
            .iter()
            .find(|participant| participant.id == *id)
            .map(|participant| participant.display_name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn pair_label(&self, from: &ParticipantId, to: &ParticipantId) -> String {
        format!("{} → {}", self.display_name(from), self.display_name(to))
    }

    /// Drops a recipient missing from a known target set. Skipped while busy.
    fn restore_recipient(&mut self, capabilities: &CapabilityState) {
        if self.busy {
            return;
        }
        let Some(reachable) = capabilities.reachable() else {
            return;
        };
        if reachable.is_empty() {
            return;
        }
        let Some(to) = self.selection.to_id.clone() else {
            return;
        };
        if reachable.contains(&to) {
            return;
        }

        warn!(to = %to, "flow: selected recipient is no longer reachable");
        self.set_to(None);
        self.realign_payment_phase();
        self.selection.notice = Some(RECIPIENT_UNAVAILABLE_NOTICE.to_string());
        self.emit(FlowEvent::SelectionChanged(self.selection.clone()));
    }

    fn restore_recipient_from_cache(&mut self) {
        let cached = self
            .selection
            .from_id
            .as_ref()
            .and_then(|from| self.capability_for(from))
            .cloned();
        if let Some(capabilities) = cached {
            self.restore_recipient(&capabilities);
        }
    }

    fn start_flow(&mut self, target: Phase) -> FlowOutcome {
        if self.actions_disabled {
            return FlowOutcome::Rejected(ACTIONS_DISABLED_MESSAGE.to_string());
        }
        if !self.phase.is_idle() {
            debug!(phase = %self.phase, "flow: start ignored outside idle");
            return FlowOutcome::Ignored;
        }
        self.transition(target);
        FlowOutcome::Advanced
    }

    fn snapshot(&self) -> FlowSnapshot {
        let capabilities = self
            .selection
            .from_id
            .as_ref()
            .and_then(|from| self.capability_for(from))
            .cloned();
        let payment_check = self.payment_check();
        let recipient_admitted = match (&capabilities, &self.selection.to_id) {
            (Some(capabilities), Some(to)) => capabilities.admits(to),
            _ => true,
        };
        let can_confirm_payment = !self.busy
            && recipient_admitted
            && payment_check.as_ref().is_some_and(AmountCheck::can_confirm);

        FlowSnapshot {
            phase: self.phase,
            selection: self.selection.clone(),
            busy: self.busy,
            actions_disabled: self.actions_disabled,
            equivalent: self.equivalent.clone(),
            capabilities,
            history: self.history.visible(),
            notice: self.notice.clone(),
            payment_amount: self.payment_amount.clone(),
            payment_check,
            can_confirm_payment,
            close_armed: self.close_armer.is_armed(),
            full_editor: self.full_editor,
            overlay: self.overlays.last().cloned(),
        }
    }
}

impl EscapeTarget for FlowState {
    fn close_top_overlay(&mut self) -> Option<OverlayKind> {
        self.overlays.pop()
    }

    fn disarm_confirmation(&mut self) -> bool {
        self.close_armer.signal(DisarmSignal::Escape)
    }

    fn cancel_flow(&mut self) -> bool {
        self.transition(Phase::Idle)
    }
}

pub struct FlowController {
    gateway: Arc<dyn ActionGateway>,
    escape_chain: EscapeChain,
    inner: Mutex<FlowState>,
    events: broadcast::Sender<FlowEvent>,
}

impl FlowController {
    pub fn new(gateway: Arc<dyn ActionGateway>, options: FlowOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            gateway,
            escape_chain: EscapeChain::default(),
            inner: Mutex::new(FlowState {
                phase: Phase::Idle,
                epoch: 0,
                selection: SelectionState::default(),
                busy: false,
                actions_disabled: false,
                equivalent: options.equivalent,
                routing: options.routing,
                capabilities: CapabilityCache::new(),
                history: HistoryLog::new(options.history_capacity, options.history_visible),
                close_armer: DestructiveConfirmArmer::for_trustline_close(),
                overlays: Vec::new(),
                payment_amount: String::new(),
                full_editor: false,
                participants: Vec::new(),
                trustlines: Vec::new(),
                notice: None,
                events: events.clone(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> FlowSnapshot {
        self.inner.lock().await.snapshot()
    }

    pub async fn phase(&self) -> Phase {
        self.inner.lock().await.phase
    }

    pub async fn selection(&self) -> SelectionState {
        self.inner.lock().await.selection.clone()
    }

    pub async fn is_busy(&self) -> bool {
        self.inner.lock().await.busy
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().await.history.visible()
    }

    pub async fn trustlines(&self) -> Vec<TrustlineSummary> {
        self.inner.lock().await.trustlines.clone()
    }

    pub async fn participants(&self) -> Vec<ParticipantSummary> {
        self.inner.lock().await.participants.clone()
    }

    pub async fn start_payment_flow(&self) -> FlowOutcome {
        self.inner
            .lock()
            .await
            .start_flow(Phase::PickingPaymentFrom)
    }

    pub async fn start_trustline_flow(&self) -> FlowOutcome {
        self.inner
            .lock()
            .await
            .start_flow(Phase::PickingTrustlineFrom)
    }

    pub async fn start_clearing_flow(&self) -> FlowOutcome {
        self.inner.lock().await.start_flow(Phase::ConfirmClearing)
    }

    pub async fn select_node(&self, id: ParticipantId) -> FlowOutcome {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        match state.phase {
            Phase::PickingPaymentFrom => {
                state.set_from(Some(id));
                state.realign_payment_phase();
                FlowOutcome::Advanced
            }
            Phase::PickingPaymentTo => {
                if state.selection.from_id.as_ref() == Some(&id) {
                    return FlowOutcome::Rejected(SAME_PARTICIPANT_MESSAGE.to_string());
                }
                state.set_to(Some(id));
                state.realign_payment_phase();
                FlowOutcome::Advanced
            }
            Phase::PickingTrustlineFrom => {
                state.set_from(Some(id));
                state.transition(Phase::PickingTrustlineTo);
                FlowOutcome::Advanced
            }
            Phase::PickingTrustlineTo => {
                let Some(from) = state.selection.from_id.clone() else {
                    state.transition(Phase::PickingTrustlineFrom);
                    return FlowOutcome::Ignored;
                };
                if from == id {
                    return FlowOutcome::Rejected(SAME_PARTICIPANT_MESSAGE.to_string());
                }
                let exists = state.find_trustline(&from, &id).is_some();
                state.set_to(Some(id));
                state.selection.pick_edge(None);
                state.transition(if exists {
                    Phase::EditingTrustline
                } else {
                    Phase::ConfirmTrustlineCreate
                });
                FlowOutcome::Advanced
            }
            phase => {
                debug!(phase = %phase, "flow: node pick ignored");
                FlowOutcome::Ignored
            }
        }
    }

    pub async fn set_payment_from_pid(&self, id: Option<ParticipantId>) -> FlowOutcome {
        let mut state = self.inner.lock().await;
        if !state.phase.is_payment() {
            return FlowOutcome::Ignored;
        }
        if state.busy {
            return FlowOutcome::Rejected(BUSY_MESSAGE.to_string());
        }
        state.set_from(id);
        state.realign_payment_phase();
        FlowOutcome::Advanced
    }

    pub async fn set_payment_to_pid(&self, id: Option<ParticipantId>) -> FlowOutcome {
        let mut state = self.inner.lock().await;
        if !state.phase.is_payment() {
            return FlowOutcome::Ignored;
        }
        if state.busy {
            return FlowOutcome::Rejected(BUSY_MESSAGE.to_string());
        }
        if id.is_some() && id == state.selection.from_id {
            return FlowOutcome::Rejected(SAME_PARTICIPANT_MESSAGE.to_string());
        }
        state.set_to(id);
        state.realign_payment_phase();
        FlowOutcome::Advanced
    }

    pub async fn set_payment_amount(&self, text: &str) {
        let mut state = self.inner.lock().await;
        if state.phase.is_payment() {
            state.payment_amount = text.to_string();
        }
    }

    pub async fn payment_check(&self) -> Option<AmountCheck> {
        self.inner.lock().await.payment_check()
    }

    pub async fn confirm_payment(&self, amount_text: &str) -> FlowOutcome {
        let (equivalent, from, to, amount, summary, epoch) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            if state.phase != Phase::ConfirmPayment {
                return FlowOutcome::Ignored;
            }
            if state.busy {
                return FlowOutcome::Rejected(BUSY_MESSAGE.to_string());
            }
            let Some((from, to)) = state.distinct_pair() else {
                return state.reject(MISSING_SELECTION_MESSAGE);
            };
            state.payment_amount = amount_text.to_string();

            let capacity = state.direct_capacity(&from, &to);
            let check = check_payment_amount(amount_text, capacity.as_deref(), state.routing);
            if let Some(err) = check.error {
                return state.reject(err.to_string());
            }
            if state
                .capability_for(&from)
                .is_some_and(|capabilities| !capabilities.admits(&to))
            {
                return state.reject(UNREACHABLE_RECIPIENT_MESSAGE);
            }
            if let Some(warning) = &check.warning {
                info!(from = %from, to = %to, "flow: submitting despite advisory: {warning}");
            }
            let Some(amount) = check.normalized else {
                return state.reject(MISSING_SELECTION_MESSAGE);
            };

            let summary = format!(
                "{amount} {}: {}",
                state.equivalent,
                state.pair_label(&from, &to)
            );
            let epoch = state.begin_mutation();
            (state.equivalent.clone(), from, to, amount, summary, epoch)
        };

        info!(from = %from, to = %to, amount = %amount, "flow: sending payment");
        let result = self
            .gateway
            .send_payment(&equivalent, &from, &to, &amount)
            .await;

        {
            let mut state = self.inner.lock().await;
            state.finish_mutation(ActionKind::Payment, summary, &result, "Payment sent");
            match &result {
                Ok(_) => {
                    if state.epoch == epoch {
                        state.transition(Phase::Idle);
                    }
                }
                Err(err) => {
                    let in_place = state.epoch == epoch;
                    state.restore_recipient_from_cache();
                    if in_place {
                        state.selection.error = Some(err.message.clone());
                    }
                    return FlowOutcome::Failed(err.message.clone());
                }
            }
        }

        self.refresh_trustlines_after_mutation().await;
        FlowOutcome::Completed
    }

    pub async fn select_trustline(&self, from: ParticipantId, to: ParticipantId) -> FlowOutcome {
        self.select_trustline_at(from, to, None).await
    }

    pub async fn select_trustline_at(
        &self,
        from: ParticipantId,
        to: ParticipantId,
        anchor: Option<ScreenPoint>,
    ) -> FlowOutcome {
        let mut state = self.inner.lock().await;
        if from == to {
            return FlowOutcome::Ignored;
        }
        if !(state.phase.is_idle() || state.phase.is_trustline()) {
            debug!(phase = %state.phase, "flow: edge pick ignored");
            return FlowOutcome::Ignored;
        }
        if state.busy {
            return FlowOutcome::Rejected(BUSY_MESSAGE.to_string());
        }
        state.set_from(Some(from));
        state.set_to(Some(to));
        state.selection.pick_edge(anchor);
        state.transition(Phase::EditingTrustline);
        FlowOutcome::Advanced
    }

    pub async fn set_full_editor(&self, enabled: bool) -> FlowOutcome {
        let mut state = self.inner.lock().await;
        if !state.phase.is_trustline() {
            return FlowOutcome::Ignored;
        }
        state.full_editor = enabled;
        FlowOutcome::Advanced
    }

    pub async fn confirm_trustline_create(&self, limit_text: &str) -> FlowOutcome {
        let (equivalent, from, to, limit, summary, epoch) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            if state.phase != Phase::ConfirmTrustlineCreate {
                return FlowOutcome::Ignored;
            }
            if state.busy {
                return FlowOutcome::Rejected(BUSY_MESSAGE.to_string());
            }
            let Some((from, to)) = state.distinct_pair() else {
                return state.reject(MISSING_SELECTION_MESSAGE);
            };
            let limit = match parse_positive_amount(limit_text) {
                Ok((limit, _)) => limit,
                Err(err) => return state.reject(err.to_string()),
            };
            if state.find_trustline(&from, &to).is_some() {
                return state.reject(TRUSTLINE_EXISTS_MESSAGE);
            }

            let summary = format!(
                "{}, limit {limit} {}",
                state.pair_label(&from, &to),
                state.equivalent
            );
            let epoch = state.begin_mutation();
            (state.equivalent.clone(), from, to, limit, summary, epoch)
        };

        info!(from = %from, to = %to, limit = %limit, "flow: creating trustline");
        let result = self
            .gateway
            .create_trustline(&equivalent, &from, &to, &limit)
            .await;
        self.settle_trustline(ActionKind::TrustlineCreate, summary, epoch, result, "Trustline created")
            .await
    }

    pub async fn confirm_trustline_update(&self, new_limit_text: &str) -> FlowOutcome {
        let (equivalent, from, to, limit, summary, epoch) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            if state.phase != Phase::EditingTrustline {
                return FlowOutcome::Ignored;
            }
            if state.busy {
                return FlowOutcome::Rejected(BUSY_MESSAGE.to_string());
            }
            let Some((from, to)) = state.distinct_pair() else {
                return state.reject(MISSING_SELECTION_MESSAGE);
            };
            let (limit, value) = match parse_positive_amount(new_limit_text) {
                Ok(parsed) => parsed,
                Err(err) => return state.reject(err.to_string()),
            };
            let used_above_limit = state
                .find_trustline(&from, &to)
                .filter(|line| parse_capacity(&line.used).is_some_and(|used| value < used))
                .map(|line| line.used.clone());
            if let Some(used) = used_above_limit {
                return state.reject(format!("limit cannot be below current usage ({used})"));
            }

            let summary = format!(
                "{}, limit {limit} {}",
                state.pair_label(&from, &to),
                state.equivalent
            );
            let epoch = state.begin_mutation();
            (state.equivalent.clone(), from, to, limit, summary, epoch)
        };

        info!(from = %from, to = %to, limit = %limit, "flow: updating trustline");
        let result = self
            .gateway
            .update_trustline(&equivalent, &from, &to, &limit)
            .await;
        self.settle_trustline(ActionKind::TrustlineUpdate, summary, epoch, result, "Trustline updated")
            .await
    }

    pub async fn confirm_trustline_close(&self) -> FlowOutcome {
        let (equivalent, from, to, summary, epoch) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            if state.phase != Phase::EditingTrustline {
                return FlowOutcome::Ignored;
            }
            if state.busy {
                return FlowOutcome::Rejected(BUSY_MESSAGE.to_string());
            }
            let Some((from, to)) = state.distinct_pair() else {
                return state.reject(MISSING_SELECTION_MESSAGE);
            };
            let in_use = state.find_trustline(&from, &to).is_some_and(|line| {
                [&line.used, &line.reverse_used]
                    .into_iter()
                    .any(|raw| parse_capacity(raw).is_some_and(|value| !value.is_zero()))
            });
            if in_use {
                state.close_armer.disarm();
                return state.reject(TRUSTLINE_IN_USE_MESSAGE);
            }

            if state.close_armer.press() == ArmStep::Armed {
                debug!(from = %from, to = %to, "flow: trustline close armed");
                return FlowOutcome::Armed;
            }

            let summary = state.pair_label(&from, &to);
            let epoch = state.begin_mutation();
            (state.equivalent.clone(), from, to, summary, epoch)
        };

        info!(from = %from, to = %to, "flow: closing trustline");
        let result = self.gateway.close_trustline(&equivalent, &from, &to).await;
        self.settle_trustline(ActionKind::TrustlineClose, summary, epoch, result, "Trustline closed")
            .await
    }

    async fn settle_trustline(
        &self,
        kind: ActionKind,
        summary: String,
        epoch: u64,
        result: GatewayResult<()>,
        success_text: &str,
    ) -> FlowOutcome {
        {
            let mut state = self.inner.lock().await;
            state.finish_mutation(kind, summary, &result, success_text);
            if let Err(err) = &result {
                state.fail_in_place(epoch, err);
                return FlowOutcome::Failed(err.message.clone());
            }
            if state.epoch == epoch {
                state.transition(Phase::Idle);
            }
        }

        self.refresh_trustlines_after_mutation().await;
        FlowOutcome::Completed
    }

    pub async fn confirm_clearing(&self) -> FlowOutcome {
        let (equivalent, epoch) = {
            let mut state = self.inner.lock().await;
            if state.phase != Phase::ConfirmClearing {
                return FlowOutcome::Ignored;
            }
            if state.busy {
                return FlowOutcome::Rejected(BUSY_MESSAGE.to_string());
            }
            state.begin_mutation();
            state.transition(Phase::ClearingRunning);
            (state.equivalent.clone(), state.epoch)
        };

        info!(equivalent = %equivalent, "flow: running clearing");
        let result = self.gateway.run_clearing(&equivalent).await;

        {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let summary = match &result {
                Ok(clearing) => format!(
                    "{} cycles, {} {equivalent} cleared",
                    clearing.cycles.len(),
                    clearing.total_cleared
                ),
                Err(_) => "clearing run".to_string(),
            };
            let success_text = match &result {
                Ok(clearing) => format!("Clearing complete: {} cleared", clearing.total_cleared),
                Err(_) => String::new(),
            };
            state.finish_mutation(ActionKind::Clearing, summary, &result, &success_text);

            match result {
                Ok(clearing) => {
                    if state.epoch == epoch {
                        state.transition(Phase::ClearingPreview);
                        state.selection.last_clearing = Some(ClearingSummary::from(clearing));
                    }
                }
                Err(err) => {
                    if state.epoch == epoch {
                        state.transition(Phase::ConfirmClearing);
                        state.selection.error = Some(err.message.clone());
                    }
                    return FlowOutcome::Failed(err.message);
                }
            }
        }

        self.refresh_trustlines_after_mutation().await;
        FlowOutcome::Completed
    }

    pub async fn acknowledge_clearing(&self) -> FlowOutcome {
        let mut state = self.inner.lock().await;
        if state.phase != Phase::ClearingPreview {
            return FlowOutcome::Ignored;
        }
        state.transition(Phase::Idle);
        FlowOutcome::Advanced
    }

    /// Returns to idle from any phase. A call still in flight keeps `busy`
    /// until it settles but no longer moves the phase.
    pub async fn cancel(&self) -> FlowOutcome {
        let mut state = self.inner.lock().await;
        if state.cancel_flow() {
            FlowOutcome::Advanced
        } else {
            FlowOutcome::Ignored
        }
    }

    pub async fn handle_escape(&self) -> EscapeResolution {
        let mut state = self.inner.lock().await;
        let resolution = self.escape_chain.dispatch(&mut *state);
        debug!(?resolution, "flow: escape resolved");
        resolution
    }

    pub async fn open_overlay(&self, overlay: OverlayKind) {
        self.inner.lock().await.overlays.push(overlay);
    }

    pub async fn close_overlay(&self) -> Option<OverlayKind> {
        self.inner.lock().await.overlays.pop()
    }

    pub async fn dismiss_error(&self) {
        self.inner.lock().await.selection.error = None;
    }

    pub async fn dismiss_notice(&self) {
        self.inner.lock().await.notice = None;
    }

    pub async fn expire_notice(&self, now: Instant) -> bool {
        let mut state = self.inner.lock().await;
        if state.notice.as_ref().is_some_and(|notice| notice.is_expired(now)) {
            state.notice = None;
            return true;
        }
        false
    }

    pub async fn set_actions_disabled(&self, disabled: bool) {
        self.inner.lock().await.actions_disabled = disabled;
    }

    pub async fn set_equivalent(&self, equivalent: EquivalentCode) -> FlowOutcome {
        let mut state = self.inner.lock().await;
        if state.busy {
            return FlowOutcome::Rejected(BUSY_MESSAGE.to_string());
        }
        if state.equivalent == equivalent {
            return FlowOutcome::Ignored;
        }
        info!(equivalent = %equivalent, "flow: switching equivalent");
        state.equivalent = equivalent;
        state.capabilities.invalidate();
        state.trustlines.clear();
        FlowOutcome::Advanced
    }

    pub async fn payment_targets(&self) -> Option<CapabilityState> {
        let (ticket, max_hops) = {
            let mut state = self.inner.lock().await;
            if !state.phase.is_payment() {
                return None;
            }
            let from = state.selection.from_id.clone()?;
            let key = CapabilityKey::new(state.equivalent.clone(), from);
            match state.capabilities.observe(key.clone()) {
                Some(ticket) => {
                    state.emit(FlowEvent::CapabilitiesUpdated {
                        key,
                        state: CapabilityState::Loading,
                    });
                    (ticket, state.routing.max_hops())
                }
                None => return state.capabilities.state().cloned(),
            }
        };

        debug!(from = %ticket.key().from, max_hops, "flow: fetching payment targets");
        let result = self
            .gateway
            .fetch_payment_targets(&ticket.key().equivalent, &ticket.key().from, max_hops)
            .await;

        let mut state = self.inner.lock().await;
        if let Err(err) = &result {
            warn!(from = %ticket.key().from, "flow: payment targets unavailable: {err}");
            state.note_gateway_failure(err);
        }
        let applied = state
            .capabilities
            .resolve(&ticket, result.map_err(|err| err.message))
            .cloned();
        if let Some(capabilities) = applied {
            state.emit(FlowEvent::CapabilitiesUpdated {
                key: ticket.key().clone(),
                state: capabilities.clone(),
            });
            state.restore_recipient(&capabilities);
        }
        state.capabilities.state().cloned()
    }

    pub async fn capability_state(&self) -> Option<CapabilityState> {
        let state = self.inner.lock().await;
        let from = state.selection.from_id.as_ref()?;
        state.capability_for(from).cloned()
    }

    pub async fn refresh_participants(&self) -> GatewayResult<usize> {
        let result = self.gateway.fetch_participants().await;
        let mut state = self.inner.lock().await;
        match result {
            Ok(participants) => {
                let count = participants.len();
                state.participants = participants;
                Ok(count)
            }
            Err(err) => {
                state.note_gateway_failure(&err);
                Err(err)
            }
        }
    }

    pub async fn refresh_trustlines(&self) -> GatewayResult<usize> {
        let equivalent = self.inner.lock().await.equivalent.clone();
        let result = self.gateway.fetch_trustlines(&equivalent).await;
        let mut state = self.inner.lock().await;
        match result {
            Ok(trustlines) => {
                let count = trustlines.len();
                if state.equivalent == equivalent {
                    state.trustlines = trustlines;
                } else {
                    debug!(equivalent = %equivalent, "flow: discarding trustlines for previous equivalent");
                }
                Ok(count)
            }
            Err(err) => {
                state.note_gateway_failure(&err);
                Err(err)
            }
        }
    }

    async fn refresh_trustlines_after_mutation(&self) {
        if let Err(err) = self.refresh_trustlines().await {
            warn!("flow: trustline refresh after action failed: {err}");
        }
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
