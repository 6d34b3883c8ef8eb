use super::*;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use shared::{
    domain::EdgeKey,
    error::ErrorCode,
    protocol::{ClearingCycle, ClearingEdge, ClearingResult, PaymentReceipt, PaymentTarget},
};
use tokio::sync::Notify;

#[derive(Default)]
struct Calls {
    payments: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    closes: AtomicUsize,
    clearings: AtomicUsize,
    participants: AtomicUsize,
    trustlines: AtomicUsize,
    targets: AtomicUsize,
}

fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[derive(Default)]
struct ScriptedGateway {
    calls: Calls,
    last_amount: StdMutex<Option<String>>,
    mutation_error: StdMutex<Option<GatewayError>>,
    payment_gate: StdMutex<Option<Arc<Notify>>>,
    targets: StdMutex<HashMap<String, GatewayResult<Vec<PaymentTarget>>>>,
    target_gates: StdMutex<HashMap<String, Arc<Notify>>>,
    trustlines: StdMutex<Vec<TrustlineSummary>>,
}

impl ScriptedGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fail_mutations_with(&self, err: GatewayError) {
        *self.mutation_error.lock().expect("lock") = Some(err);
    }

    fn succeed_mutations(&self) {
        *self.mutation_error.lock().expect("lock") = None;
    }

    fn gate_payments(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.payment_gate.lock().expect("lock") = Some(Arc::clone(&gate));
        gate
    }

    fn gate_targets(&self, from: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.target_gates
            .lock()
            .expect("lock")
            .insert(from.to_string(), Arc::clone(&gate));
        gate
    }

    fn set_targets(&self, from: &str, targets: GatewayResult<Vec<&str>>) {
        let targets = targets.map(|ids| {
            ids.into_iter()
                .map(|id| PaymentTarget {
                    to_id: ParticipantId::new(id),
                })
                .collect()
        });
        self.targets
            .lock()
            .expect("lock")
            .insert(from.to_string(), targets);
    }

    fn set_trustlines(&self, lines: Vec<TrustlineSummary>) {
        *self.trustlines.lock().expect("lock") = lines;
    }

    fn mutation_result(&self) -> GatewayResult<()> {
        match self.mutation_error.lock().expect("lock").clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ActionGateway for ScriptedGateway {
    async fn send_payment(
        &self,
        _equivalent: &EquivalentCode,
        _from: &ParticipantId,
        _to: &ParticipantId,
        amount: &str,
    ) -> GatewayResult<PaymentReceipt> {
        self.calls.payments.fetch_add(1, Ordering::SeqCst);
        *self.last_amount.lock().expect("lock") = Some(amount.to_string());
        let gate = self.payment_gate.lock().expect("lock").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.mutation_result().map(|_| PaymentReceipt {
            transaction_id: Some("tx-1".to_string()),
            status: None,
        })
    }

    async fn create_trustline(
        &self,
        _equivalent: &EquivalentCode,
        _from: &ParticipantId,
        _to: &ParticipantId,
        _limit: &str,
    ) -> GatewayResult<()> {
        self.calls.creates.fetch_add(1, Ordering::SeqCst);
        self.mutation_result()
    }

    async fn update_trustline(
        &self,
        _equivalent: &EquivalentCode,
        _from: &ParticipantId,
        _to: &ParticipantId,
        _new_limit: &str,
    ) -> GatewayResult<()> {
        self.calls.updates.fetch_add(1, Ordering::SeqCst);
        self.mutation_result()
    }

    async fn close_trustline(
        &self,
        _equivalent: &EquivalentCode,
        _from: &ParticipantId,
        _to: &ParticipantId,
    ) -> GatewayResult<()> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        self.mutation_result()
    }

    async fn run_clearing(&self, _equivalent: &EquivalentCode) -> GatewayResult<ClearingResult> {
        self.calls.clearings.fetch_add(1, Ordering::SeqCst);
        self.mutation_result().map(|_| ClearingResult {
            cycles: vec![ClearingCycle {
                edges: vec![
                    ClearingEdge {
                        from_id: ParticipantId::new("alice"),
                        to_id: ParticipantId::new("bob"),
                        amount: "3".to_string(),
                    },
                    ClearingEdge {
                        from_id: ParticipantId::new("bob"),
                        to_id: ParticipantId::new("alice"),
                        amount: "3".to_string(),
                    },
                ],
                cleared_amount: "3".to_string(),
            }],
            total_cleared: "3".to_string(),
            completed_at: None,
        })
    }

    async fn fetch_participants(&self) -> GatewayResult<Vec<ParticipantSummary>> {
        self.calls.participants.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            ParticipantSummary {
                id: ParticipantId::new("alice"),
                display_name: "Alice".to_string(),
            },
            ParticipantSummary {
                id: ParticipantId::new("bob"),
                display_name: "Bob".to_string(),
            },
        ])
    }

    async fn fetch_trustlines(
        &self,
        _equivalent: &EquivalentCode,
    ) -> GatewayResult<Vec<TrustlineSummary>> {
        self.calls.trustlines.fetch_add(1, Ordering::SeqCst);
        Ok(self.trustlines.lock().expect("lock").clone())
    }

    async fn fetch_payment_targets(
        &self,
        _equivalent: &EquivalentCode,
        from: &ParticipantId,
        _max_hops: u8,
    ) -> GatewayResult<Vec<PaymentTarget>> {
        self.calls.targets.fetch_add(1, Ordering::SeqCst);
        let gate = self.target_gates.lock().expect("lock").get(from.as_str()).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.targets
            .lock()
            .expect("lock")
            .get(from.as_str())
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

fn pid(id: &str) -> ParticipantId {
    ParticipantId::new(id)
}

fn trustline(from: &str, to: &str, used: &str, reverse_used: &str, available: &str) -> TrustlineSummary {
    TrustlineSummary {
        from_id: pid(from),
        to_id: pid(to),
        limit: "100".to_string(),
        used: used.to_string(),
        reverse_used: reverse_used.to_string(),
        available: available.to_string(),
        status: TrustlineStatus::Active,
    }
}

fn controller_with(gateway: &Arc<ScriptedGateway>, options: FlowOptions) -> Arc<FlowController> {
    FlowController::new(Arc::clone(gateway) as Arc<dyn ActionGateway>, options)
}

fn controller(gateway: &Arc<ScriptedGateway>) -> Arc<FlowController> {
    controller_with(gateway, FlowOptions::default())
}

async fn reach_confirm_payment(controller: &FlowController, from: &str, to: &str) {
    assert_eq!(controller.start_payment_flow().await, FlowOutcome::Advanced);
    assert_eq!(controller.select_node(pid(from)).await, FlowOutcome::Advanced);
    assert_eq!(controller.select_node(pid(to)).await, FlowOutcome::Advanced);
    assert_eq!(controller.phase().await, Phase::ConfirmPayment);
}

#[tokio::test]
async fn picking_two_nodes_reaches_confirm_payment() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);

    controller.start_payment_flow().await;
    assert_eq!(controller.phase().await, Phase::PickingPaymentFrom);
    controller.select_node(pid("alice")).await;
    assert_eq!(controller.phase().await, Phase::PickingPaymentTo);
    controller.select_node(pid("bob")).await;

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::ConfirmPayment);
    assert_eq!(snapshot.selection.from_id, Some(pid("alice")));
    assert_eq!(snapshot.selection.to_id, Some(pid("bob")));
    assert!(snapshot.selection.selected_edge_key.is_none());
}

#[tokio::test]
async fn recipient_equal_to_sender_is_rejected() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);

    controller.start_payment_flow().await;
    controller.select_node(pid("alice")).await;
    let outcome = controller.select_node(pid("alice")).await;
    assert!(matches!(outcome, FlowOutcome::Rejected(_)));
    assert_eq!(controller.phase().await, Phase::PickingPaymentTo);
    assert!(controller.selection().await.to_id.is_none());

    let outcome = controller.set_payment_to_pid(Some(pid("alice"))).await;
    assert!(matches!(outcome, FlowOutcome::Rejected(_)));
}

#[tokio::test]
async fn sender_equal_to_recipient_clears_recipient() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    controller.set_payment_from_pid(Some(pid("bob"))).await;
    let selection = controller.selection().await;
    assert_eq!(selection.from_id, Some(pid("bob")));
    assert!(selection.to_id.is_none());
    assert_eq!(controller.phase().await, Phase::PickingPaymentTo);

    controller.set_payment_to_pid(Some(pid("carol"))).await;
    assert_eq!(controller.phase().await, Phase::ConfirmPayment);

    controller.set_payment_from_pid(None).await;
    assert_eq!(controller.phase().await, Phase::PickingPaymentFrom);
}

#[tokio::test]
async fn setters_are_ignored_outside_payment_flow() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);
    assert_eq!(
        controller.set_payment_from_pid(Some(pid("alice"))).await,
        FlowOutcome::Ignored
    );
    assert_eq!(controller.select_node(pid("alice")).await, FlowOutcome::Ignored);
    assert_eq!(controller.confirm_payment("5").await, FlowOutcome::Ignored);
    assert_eq!(controller.phase().await, Phase::Idle);
}

#[tokio::test]
async fn non_positive_amounts_never_reach_the_backend() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    for amount in ["0", "-1"] {
        let outcome = controller.confirm_payment(amount).await;
        assert_eq!(
            outcome,
            FlowOutcome::Rejected("enter a positive amount".to_string())
        );
        let selection = controller.selection().await;
        assert_eq!(selection.error.as_deref(), Some("enter a positive amount"));
    }
    assert_eq!(count(&gateway.calls.payments), 0);
    assert_eq!(controller.phase().await, Phase::ConfirmPayment);
}

#[tokio::test]
async fn multi_separator_amount_is_a_format_error() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    let outcome = controller.confirm_payment("1,2,3").await;
    assert_eq!(
        outcome,
        FlowOutcome::Rejected("invalid amount format".to_string())
    );
    assert_eq!(count(&gateway.calls.payments), 0);
}

#[tokio::test]
async fn single_hop_blocks_payment_above_direct_capacity() {
    let gateway = ScriptedGateway::new();
    gateway.set_trustlines(vec![trustline("bob", "alice", "0", "0", "10")]);
    let controller = controller(&gateway);
    controller.refresh_trustlines().await.expect("trustlines");
    reach_confirm_payment(&controller, "alice", "bob").await;

    controller.set_payment_amount("11").await;
    let snapshot = controller.snapshot().await;
    assert!(!snapshot.can_confirm_payment);
    let check = snapshot.payment_check.expect("check");
    assert!(check.error.expect("error").to_string().contains("max: 10"));

    let outcome = controller.confirm_payment("11").await;
    match outcome {
        FlowOutcome::Rejected(message) => assert!(message.contains("max: 10"), "{message}"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(count(&gateway.calls.payments), 0);
}

#[tokio::test]
async fn multi_hop_warns_but_allows_payment_above_direct_capacity() {
    let gateway = ScriptedGateway::new();
    gateway.set_trustlines(vec![trustline("bob", "alice", "0", "0", "10")]);
    let controller = controller_with(
        &gateway,
        FlowOptions {
            routing: RoutingMode::MultiHop { max_hops: 4 },
            ..FlowOptions::default()
        },
    );
    controller.refresh_trustlines().await.expect("trustlines");
    reach_confirm_payment(&controller, "alice", "bob").await;

    controller.set_payment_amount("11").await;
    let snapshot = controller.snapshot().await;
    assert!(snapshot.can_confirm_payment);
    let warning = snapshot
        .payment_check
        .and_then(|check| check.warning)
        .expect("warning");
    assert!(warning.contains("max: 10"));

    assert_eq!(controller.confirm_payment("11").await, FlowOutcome::Completed);
    assert_eq!(count(&gateway.calls.payments), 1);
}

#[tokio::test]
async fn successful_payment_returns_to_idle_and_records_history() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);
    controller.refresh_participants().await.expect("participants");
    reach_confirm_payment(&controller, "alice", "bob").await;

    assert_eq!(controller.confirm_payment("1,5").await, FlowOutcome::Completed);
    assert_eq!(
        gateway.last_amount.lock().expect("lock").as_deref(),
        Some("1.5")
    );

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.selection, SelectionState::default());
    assert!(!snapshot.busy);
    assert_eq!(snapshot.history.len(), 1);
    assert_eq!(snapshot.history[0].kind, ActionKind::Payment);
    assert_eq!(snapshot.history[0].outcome, ActionOutcome::Ok);
    assert!(snapshot.history[0].summary.contains("Alice → Bob"));
    assert_eq!(
        snapshot.notice.map(|notice| notice.level),
        Some(NoticeLevel::Success)
    );
    assert_eq!(count(&gateway.calls.trustlines), 1);
}

#[tokio::test]
async fn backend_rejection_keeps_confirm_phase_with_error() {
    let gateway = ScriptedGateway::new();
    gateway.fail_mutations_with(GatewayError::new("route not found").with_status(409));
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    let outcome = controller.confirm_payment("5").await;
    assert_eq!(outcome, FlowOutcome::Failed("route not found".to_string()));

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::ConfirmPayment);
    assert_eq!(snapshot.selection.error.as_deref(), Some("route not found"));
    assert!(!snapshot.busy);
    assert_eq!(snapshot.history[0].outcome, ActionOutcome::Error);

    gateway.succeed_mutations();
    assert_eq!(controller.confirm_payment("5").await, FlowOutcome::Completed);
    assert_eq!(count(&gateway.calls.payments), 2);
}

#[tokio::test]
async fn busy_gate_rejects_second_mutation_and_late_settlement_keeps_phase() {
    let gateway = ScriptedGateway::new();
    let gate = gateway.gate_payments();
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    let (outcome, _) = tokio::join!(controller.confirm_payment("5"), async {
        assert!(controller.is_busy().await);
        assert_eq!(
            controller.confirm_payment("5").await,
            FlowOutcome::Rejected(BUSY_MESSAGE.to_string())
        );

        assert_eq!(controller.cancel().await, FlowOutcome::Advanced);
        assert_eq!(controller.start_clearing_flow().await, FlowOutcome::Advanced);
        assert_eq!(
            controller.confirm_clearing().await,
            FlowOutcome::Rejected(BUSY_MESSAGE.to_string())
        );
        gate.notify_one();
    });

    assert_eq!(outcome, FlowOutcome::Completed);
    assert_eq!(count(&gateway.calls.payments), 1);
    assert_eq!(count(&gateway.calls.clearings), 0);

    let snapshot = controller.snapshot().await;
    assert!(!snapshot.busy);
    assert_eq!(snapshot.phase, Phase::ConfirmClearing);
    assert_eq!(snapshot.history.len(), 1);

    assert_eq!(controller.confirm_clearing().await, FlowOutcome::Completed);
}

#[tokio::test]
async fn targets_arriving_mid_payment_do_not_strand_the_flow() {
    let gateway = ScriptedGateway::new();
    gateway.set_targets("alice", Ok(vec!["dave"]));
    let gate = gateway.gate_payments();
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    let (outcome, _) = tokio::join!(controller.confirm_payment("5"), async {
        let state = controller.payment_targets().await.expect("state");
        assert!(!state.admits(&pid("bob")));
        let selection = controller.selection().await;
        assert_eq!(selection.to_id, Some(pid("bob")));
        assert!(selection.notice.is_none());
        assert_eq!(controller.phase().await, Phase::ConfirmPayment);
        gate.notify_one();
    });

    assert_eq!(outcome, FlowOutcome::Completed);
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.selection, SelectionState::default());
    assert_eq!(snapshot.history.len(), 1);
    assert_eq!(snapshot.history[0].outcome, ActionOutcome::Ok);
}

#[tokio::test]
async fn failed_payment_applies_deferred_recipient_drop() {
    let gateway = ScriptedGateway::new();
    gateway.set_targets("alice", Ok(vec!["dave"]));
    gateway.fail_mutations_with(GatewayError::new("route not found"));
    let gate = gateway.gate_payments();
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    let (outcome, _) = tokio::join!(controller.confirm_payment("5"), async {
        controller.payment_targets().await;
        gate.notify_one();
    });

    assert_eq!(outcome, FlowOutcome::Failed("route not found".to_string()));
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::PickingPaymentTo);
    assert!(snapshot.selection.to_id.is_none());
    assert_eq!(
        snapshot.selection.notice.as_deref(),
        Some(RECIPIENT_UNAVAILABLE_NOTICE)
    );
    assert_eq!(snapshot.selection.error.as_deref(), Some("route not found"));
}

#[tokio::test]
async fn payment_targets_fetch_once_per_sender() {
    let gateway = ScriptedGateway::new();
    gateway.set_targets("alice", Ok(vec!["bob", "carol"]));
    let controller = controller(&gateway);

    controller.start_payment_flow().await;
    assert!(controller.payment_targets().await.is_none());
    controller.select_node(pid("alice")).await;

    let state = controller.payment_targets().await.expect("state");
    assert!(state.admits(&pid("bob")));
    controller.payment_targets().await;
    controller.set_payment_amount("3").await;
    controller.snapshot().await;
    controller.payment_targets().await;
    controller.select_node(pid("bob")).await;
    controller.set_payment_amount("4").await;
    controller.payment_targets().await;

    assert_eq!(count(&gateway.calls.targets), 1);

    controller.set_payment_from_pid(Some(pid("carol"))).await;
    controller.payment_targets().await;
    assert_eq!(count(&gateway.calls.targets), 2);
}

#[tokio::test]
async fn stale_targets_for_previous_sender_are_discarded() {
    let gateway = ScriptedGateway::new();
    gateway.set_targets("alice", Ok(vec!["bob"]));
    gateway.set_targets("carol", Ok(vec!["dave"]));
    let gate = gateway.gate_targets("alice");
    let controller = controller(&gateway);

    controller.start_payment_flow().await;
    controller.select_node(pid("alice")).await;

    let (late, _) = tokio::join!(controller.payment_targets(), async {
        assert_eq!(
            controller.capability_state().await,
            Some(CapabilityState::Loading)
        );
        controller.set_payment_from_pid(Some(pid("carol"))).await;
        gate.notify_one();
    });

    assert!(late.is_none());
    assert!(controller.capability_state().await.is_none());

    let state = controller.payment_targets().await.expect("state");
    assert!(state.admits(&pid("dave")));
    assert!(!state.admits(&pid("bob")));
    assert_eq!(count(&gateway.calls.targets), 2);
}

#[tokio::test]
async fn unreachable_recipient_is_dropped_with_notice() {
    let gateway = ScriptedGateway::new();
    gateway.set_targets("alice", Ok(vec!["dave"]));
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    controller.payment_targets().await;
    let snapshot = controller.snapshot().await;
    assert!(snapshot.selection.to_id.is_none());
    assert_eq!(
        snapshot.selection.notice.as_deref(),
        Some(RECIPIENT_UNAVAILABLE_NOTICE)
    );
    assert_eq!(snapshot.phase, Phase::PickingPaymentTo);

    controller.select_node(pid("dave")).await;
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::ConfirmPayment);
    assert!(snapshot.selection.notice.is_none());
}

#[tokio::test]
async fn known_empty_targets_block_submission_without_dropping_recipient() {
    let gateway = ScriptedGateway::new();
    gateway.set_targets("alice", Ok(Vec::new()));
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    let state = controller.payment_targets().await.expect("state");
    assert!(state.is_known_empty());
    assert_eq!(controller.selection().await.to_id, Some(pid("bob")));

    controller.set_payment_amount("1").await;
    assert!(!controller.snapshot().await.can_confirm_payment);
    assert_eq!(
        controller.confirm_payment("1").await,
        FlowOutcome::Rejected(UNREACHABLE_RECIPIENT_MESSAGE.to_string())
    );
    assert_eq!(count(&gateway.calls.payments), 0);
}

#[tokio::test]
async fn amount_errors_take_precedence_over_reachability() {
    let gateway = ScriptedGateway::new();
    gateway.set_targets("alice", Ok(Vec::new()));
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;
    controller.payment_targets().await;

    assert_eq!(
        controller.confirm_payment("0").await,
        FlowOutcome::Rejected("enter a positive amount".to_string())
    );
    assert_eq!(
        controller.confirm_payment("1,2,3").await,
        FlowOutcome::Rejected("invalid amount format".to_string())
    );
    assert_eq!(count(&gateway.calls.payments), 0);
}

#[tokio::test]
async fn degraded_targets_fall_back_to_unfiltered() {
    let gateway = ScriptedGateway::new();
    gateway.set_targets("alice", Err(GatewayError::new("routing unavailable")));
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    let state = controller.payment_targets().await.expect("state");
    assert_eq!(state.error_hint(), Some("routing unavailable"));
    assert_eq!(controller.selection().await.to_id, Some(pid("bob")));
    assert_eq!(controller.confirm_payment("2").await, FlowOutcome::Completed);
}

#[tokio::test]
async fn close_requires_second_click_in_same_armed_session() {
    let gateway = ScriptedGateway::new();
    gateway.set_trustlines(vec![
        trustline("alice", "bob", "0", "0", "100"),
        trustline("alice", "carol", "0", "0", "100"),
    ]);
    let controller = controller(&gateway);
    controller.refresh_trustlines().await.expect("trustlines");

    controller.select_trustline(pid("alice"), pid("bob")).await;
    assert_eq!(controller.phase().await, Phase::EditingTrustline);

    assert_eq!(controller.confirm_trustline_close().await, FlowOutcome::Armed);
    assert_eq!(count(&gateway.calls.closes), 0);
    assert!(controller.snapshot().await.close_armed);

    controller.select_trustline(pid("alice"), pid("carol")).await;
    assert!(!controller.snapshot().await.close_armed);
    assert_eq!(controller.confirm_trustline_close().await, FlowOutcome::Armed);
    assert_eq!(count(&gateway.calls.closes), 0);

    assert_eq!(
        controller.confirm_trustline_close().await,
        FlowOutcome::Completed
    );
    assert_eq!(count(&gateway.calls.closes), 1);
    assert_eq!(controller.phase().await, Phase::Idle);
    assert_eq!(controller.history().await[0].kind, ActionKind::TrustlineClose);
}

#[tokio::test]
async fn phase_change_disarms_close() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);

    controller.select_trustline(pid("alice"), pid("bob")).await;
    assert_eq!(controller.confirm_trustline_close().await, FlowOutcome::Armed);
    controller.cancel().await;
    controller.select_trustline(pid("alice"), pid("bob")).await;
    assert_eq!(controller.confirm_trustline_close().await, FlowOutcome::Armed);
    assert_eq!(count(&gateway.calls.closes), 0);
}

#[tokio::test]
async fn starting_another_mutation_disarms_close() {
    let gateway = ScriptedGateway::new();
    gateway.fail_mutations_with(GatewayError::new("limit rejected"));
    let controller = controller(&gateway);

    controller.select_trustline(pid("alice"), pid("bob")).await;
    assert_eq!(controller.confirm_trustline_close().await, FlowOutcome::Armed);
    assert_eq!(
        controller.confirm_trustline_update("50").await,
        FlowOutcome::Failed("limit rejected".to_string())
    );

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::EditingTrustline);
    assert!(!snapshot.close_armed);
    assert_eq!(controller.confirm_trustline_close().await, FlowOutcome::Armed);
    assert_eq!(count(&gateway.calls.closes), 0);
}

#[tokio::test]
async fn trustline_with_usage_cannot_be_closed() {
    let gateway = ScriptedGateway::new();
    gateway.set_trustlines(vec![trustline("alice", "bob", "0", "2.5", "100")]);
    let controller = controller(&gateway);
    controller.refresh_trustlines().await.expect("trustlines");
    controller.select_trustline(pid("alice"), pid("bob")).await;

    for _ in 0..2 {
        assert_eq!(
            controller.confirm_trustline_close().await,
            FlowOutcome::Rejected(TRUSTLINE_IN_USE_MESSAGE.to_string())
        );
    }
    assert_eq!(count(&gateway.calls.closes), 0);
    assert_eq!(
        controller.selection().await.error.as_deref(),
        Some(TRUSTLINE_IN_USE_MESSAGE)
    );
}

#[tokio::test]
async fn escape_resolves_overlay_then_confirmation_then_flow() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);

    controller.select_trustline(pid("alice"), pid("bob")).await;
    controller.confirm_trustline_close().await;
    controller.open_overlay(OverlayKind::NodeCard(pid("alice"))).await;

    assert_eq!(
        controller.handle_escape().await,
        EscapeResolution::OverlayClosed(OverlayKind::NodeCard(pid("alice")))
    );
    assert!(controller.snapshot().await.close_armed);

    assert_eq!(
        controller.handle_escape().await,
        EscapeResolution::ConfirmationDisarmed
    );
    assert_eq!(controller.phase().await, Phase::EditingTrustline);

    assert_eq!(controller.handle_escape().await, EscapeResolution::FlowCancelled);
    assert_eq!(controller.phase().await, Phase::Idle);
    assert_eq!(controller.handle_escape().await, EscapeResolution::Unhandled);
}

#[tokio::test]
async fn cancel_returns_to_idle_and_clears_error() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);

    assert_eq!(controller.cancel().await, FlowOutcome::Ignored);
    assert_eq!(controller.phase().await, Phase::Idle);

    reach_confirm_payment(&controller, "alice", "bob").await;
    controller.confirm_payment("0").await;
    assert!(controller.selection().await.error.is_some());

    assert_eq!(controller.cancel().await, FlowOutcome::Advanced);
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.selection, SelectionState::default());
    assert!(snapshot.payment_amount.is_empty());
}

#[tokio::test]
async fn dismissals_clear_error_notice_and_overlay() {
    let gateway = ScriptedGateway::new();
    gateway.fail_mutations_with(GatewayError::new("route not found"));
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    controller.confirm_payment("5").await;
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.selection.error.as_deref(), Some("route not found"));
    assert_eq!(
        snapshot.notice.map(|notice| notice.level),
        Some(NoticeLevel::Error)
    );

    controller.dismiss_error().await;
    controller.dismiss_notice().await;
    let snapshot = controller.snapshot().await;
    assert!(snapshot.selection.error.is_none());
    assert!(snapshot.notice.is_none());
    assert_eq!(snapshot.phase, Phase::ConfirmPayment);

    let edge = OverlayKind::EdgeCard(EdgeKey::new(&pid("alice"), &pid("bob")));
    controller.open_overlay(OverlayKind::History).await;
    controller.open_overlay(edge.clone()).await;
    assert_eq!(controller.snapshot().await.overlay, Some(edge.clone()));
    assert_eq!(controller.close_overlay().await, Some(edge));
    assert_eq!(controller.close_overlay().await, Some(OverlayKind::History));
    assert_eq!(controller.close_overlay().await, None);
}

#[tokio::test]
async fn visible_history_respects_display_cap() {
    let gateway = ScriptedGateway::new();
    gateway.fail_mutations_with(GatewayError::new("nope"));
    let controller = controller_with(
        &gateway,
        FlowOptions {
            history_capacity: 5,
            history_visible: 3,
            ..FlowOptions::default()
        },
    );
    reach_confirm_payment(&controller, "alice", "bob").await;

    for _ in 0..7 {
        controller.confirm_payment("1").await;
        assert!(controller.history().await.len() <= 3);
    }
    assert_eq!(controller.history().await.len(), 3);
}

#[tokio::test]
async fn actions_disabled_blocks_every_flow_entry() {
    let gateway = ScriptedGateway::new();
    gateway.fail_mutations_with(GatewayError::actions_disabled("disabled for this scenario"));
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;

    controller.confirm_payment("1").await;
    assert!(controller.snapshot().await.actions_disabled);
    controller.cancel().await;

    for outcome in [
        controller.start_payment_flow().await,
        controller.start_trustline_flow().await,
        controller.start_clearing_flow().await,
    ] {
        assert_eq!(
            outcome,
            FlowOutcome::Rejected(ACTIONS_DISABLED_MESSAGE.to_string())
        );
    }
    assert_eq!(controller.phase().await, Phase::Idle);

    controller.set_actions_disabled(false).await;
    assert_eq!(controller.start_clearing_flow().await, FlowOutcome::Advanced);
}

#[tokio::test]
async fn clearing_success_shows_preview_until_acknowledged() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);

    controller.start_clearing_flow().await;
    assert_eq!(controller.phase().await, Phase::ConfirmClearing);
    assert_eq!(controller.confirm_clearing().await, FlowOutcome::Completed);

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::ClearingPreview);
    let clearing = snapshot.selection.last_clearing.expect("clearing");
    assert_eq!(clearing.cycles.len(), 1);
    assert_eq!(clearing.total_cleared, "3");
    assert_eq!(snapshot.history[0].kind, ActionKind::Clearing);

    assert_eq!(controller.acknowledge_clearing().await, FlowOutcome::Advanced);
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Idle);
    assert!(snapshot.selection.last_clearing.is_none());
}

#[tokio::test]
async fn clearing_failure_returns_to_confirm_with_error() {
    let gateway = ScriptedGateway::new();
    gateway.fail_mutations_with(GatewayError::new("clearing engine busy"));
    let controller = controller(&gateway);

    controller.start_clearing_flow().await;
    let mut events = controller.subscribe_events();
    assert_eq!(
        controller.confirm_clearing().await,
        FlowOutcome::Failed("clearing engine busy".to_string())
    );

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::ConfirmClearing);
    assert_eq!(
        snapshot.selection.error.as_deref(),
        Some("clearing engine busy")
    );

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::PhaseChanged { to, .. } = event {
            phases.push(to);
        }
    }
    assert_eq!(phases, vec![Phase::ClearingRunning, Phase::ConfirmClearing]);
}

#[tokio::test]
async fn picking_trustline_ends_in_create_or_edit() {
    let gateway = ScriptedGateway::new();
    gateway.set_trustlines(vec![trustline("alice", "bob", "0", "0", "100")]);
    let controller = controller(&gateway);
    controller.refresh_trustlines().await.expect("trustlines");

    controller.start_trustline_flow().await;
    controller.select_node(pid("alice")).await;
    controller.select_node(pid("bob")).await;
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::EditingTrustline);
    assert_eq!(
        snapshot.selection.selected_edge_key.map(|key| key.to_string()),
        Some("alice|bob".to_string())
    );

    controller.cancel().await;
    controller.start_trustline_flow().await;
    controller.select_node(pid("alice")).await;
    controller.select_node(pid("carol")).await;
    assert_eq!(controller.phase().await, Phase::ConfirmTrustlineCreate);

    assert_eq!(
        controller.confirm_trustline_create("0").await,
        FlowOutcome::Rejected("enter a positive amount".to_string())
    );
    assert_eq!(
        controller.confirm_trustline_create("250,5").await,
        FlowOutcome::Completed
    );
    assert_eq!(count(&gateway.calls.creates), 1);
    assert_eq!(controller.phase().await, Phase::Idle);
}

#[tokio::test]
async fn update_limit_cannot_drop_below_usage() {
    let gateway = ScriptedGateway::new();
    gateway.set_trustlines(vec![trustline("alice", "bob", "40", "0", "60")]);
    let controller = controller(&gateway);
    controller.refresh_trustlines().await.expect("trustlines");
    controller.select_trustline(pid("alice"), pid("bob")).await;

    let outcome = controller.confirm_trustline_update("30").await;
    assert_eq!(
        outcome,
        FlowOutcome::Rejected("limit cannot be below current usage (40)".to_string())
    );
    assert_eq!(count(&gateway.calls.updates), 0);

    assert_eq!(
        controller.confirm_trustline_update("40").await,
        FlowOutcome::Completed
    );
    assert_eq!(count(&gateway.calls.updates), 1);
}

#[tokio::test]
async fn leaving_trustline_group_clears_full_editor() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);

    assert_eq!(controller.set_full_editor(true).await, FlowOutcome::Ignored);
    controller
        .select_trustline_at(pid("alice"), pid("bob"), Some(ScreenPoint { x: 10.0, y: 20.0 }))
        .await;
    controller.set_full_editor(true).await;
    let snapshot = controller.snapshot().await;
    assert!(snapshot.full_editor);
    assert_eq!(
        snapshot.selection.edge_anchor,
        Some(ScreenPoint { x: 10.0, y: 20.0 })
    );

    controller.cancel().await;
    assert!(!controller.snapshot().await.full_editor);
}

#[tokio::test]
async fn actions_disabled_from_backend_error_code() {
    let err = GatewayError::from_api(
        Some(503),
        shared::error::ApiError::new(ErrorCode::ActionsDisabled, "off"),
    );
    assert!(err.is_actions_disabled());
    assert_eq!(err.to_string(), "off");
}

#[tokio::test]
async fn notice_expires_after_its_delay() {
    let gateway = ScriptedGateway::new();
    let controller = controller(&gateway);
    reach_confirm_payment(&controller, "alice", "bob").await;
    controller.confirm_payment("1").await;

    let notice = controller.snapshot().await.notice.expect("notice");
    assert!(!controller.expire_notice(notice.shown_at).await);
    assert!(
        controller
            .expire_notice(notice.shown_at + notice.dismiss_after)
            .await
    );
    assert!(controller.snapshot().await.notice.is_none());
}

#[tokio::test]
async fn switching_equivalent_invalidates_targets() {
    let gateway = ScriptedGateway::new();
    gateway.set_targets("alice", Ok(vec!["bob"]));
    let controller = controller(&gateway);
    controller.start_payment_flow().await;
    controller.select_node(pid("alice")).await;
    controller.payment_targets().await;

    assert_eq!(
        controller.set_equivalent(EquivalentCode::new("USD")).await,
        FlowOutcome::Advanced
    );
    assert!(controller.capability_state().await.is_none());
    controller.payment_targets().await;
    assert_eq!(count(&gateway.calls.targets), 2);
}
