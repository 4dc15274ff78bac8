//! The document approval workflow.
//!
//! Every created or updated document enters a review pipeline: a
//! six-digit approval code is generated and written back onto the
//! aggregate, the reviewer is notified with that code, and the workflow
//! waits for an approval or rejection decision. The current pipeline
//! closes the loop itself by issuing the approval command once the
//! notification has gone out; swapping that step for a human decision
//! only means not emitting the final command.

use std::sync::Arc;

use rand::Rng;
use serde_json::Value;

use crate::aggregate::Aggregate;
use crate::command::{CommandContext, CommandEnvelope};
use crate::document::{DocumentCommand, DocumentState};
use crate::log::Recorded;
use crate::saga::{Saga, Transition};

/// Actor name stamped on commands issued by the workflow.
const SAGA_ACTOR: &str = "approval-saga";

/// Delivers the approval code to whoever reviews documents.
pub trait Notifier: Send + Sync {
    fn notify(&self, document_id: &str, code: &str);
}

/// Produces approval codes.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Default generator: a uniformly random six-digit code.
#[derive(Debug, Default)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> String {
        rand::thread_rng().gen_range(100_000..=999_999).to_string()
    }
}

/// Default notifier: writes the code to the log. Stands in for an email
/// or chat integration.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, document_id: &str, code: &str) {
        tracing::info!(document_id, code, "approval code issued for review");
    }
}

/// Collaborators injected into the approval saga at registration time.
#[derive(Clone)]
pub struct ApprovalDeps {
    pub notifier: Arc<dyn Notifier>,
    pub codes: Arc<dyn CodeGenerator>,
}

impl Default for ApprovalDeps {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LogNotifier),
            codes: Arc::new(RandomCodeGenerator),
        }
    }
}

impl std::fmt::Debug for ApprovalDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalDeps").finish_non_exhaustive()
    }
}

/// Stages of one document's trip through the approval pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalStage {
    /// A code must be generated and written onto the aggregate.
    GeneratingCode,
    /// The code is persisted; the reviewer has not been notified yet.
    SendingNotification { code: String },
    /// The reviewer has the code; awaiting a decision.
    WaitingForApproval { code: String },
    /// Terminal: the document was approved.
    Approved,
    /// Terminal: the document was rejected.
    Rejected,
}

/// One approval workflow instance, keyed by document ID.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApprovalSaga {
    stage: Option<ApprovalStage>,
    approval_code: Option<String>,
    document_id: String,
}

impl ApprovalSaga {
    /// Current pipeline stage, if the workflow has started.
    pub fn stage(&self) -> Option<&ApprovalStage> {
        self.stage.as_ref()
    }

    fn command_envelope(&self, command: &DocumentCommand) -> Option<CommandEnvelope> {
        let command = match serde_json::to_value(command) {
            Ok(value) => value,
            Err(e) => {
                // Commands are plain data; this cannot fail in practice.
                tracing::error!(document_id = %self.document_id, error = %e, "command serialization failed");
                return None;
            }
        };
        Some(CommandEnvelope {
            aggregate_type: DocumentState::AGGREGATE_TYPE.to_string(),
            instance_id: self.document_id.clone(),
            command,
            context: CommandContext::default().with_actor(SAGA_ACTOR),
        })
    }
}

impl Saga for ApprovalSaga {
    const NAME: &'static str = "approval";

    type Deps = ApprovalDeps;

    fn route(event: &Recorded) -> Option<String> {
        (event.aggregate_type == DocumentState::AGGREGATE_TYPE).then(|| event.instance_id.clone())
    }

    fn activates(event: &Recorded) -> bool {
        event.event_type == "CreatedOrUpdated"
    }

    fn transition(&mut self, event: &Recorded) -> Transition {
        match event.event_type.as_str() {
            // Any create or update (re)starts the pipeline, from any
            // stage. An edit landing mid-review supersedes the revision
            // under review, so the in-flight code is discarded and a
            // fresh one is issued for the new content; treating the edit
            // as unhandled would converge to the same decision but attach
            // it to stale content.
            "CreatedOrUpdated" => {
                self.document_id = event.instance_id.clone();
                self.approval_code = None;
                self.stage = Some(ApprovalStage::GeneratingCode);
                Transition::Accepted
            }
            "ApprovalCodeSet" if matches!(self.stage, Some(ApprovalStage::GeneratingCode)) => {
                let Some(code) = code_from_payload(&event.payload) else {
                    return Transition::Ignored;
                };
                self.approval_code = Some(code.clone());
                self.stage = Some(ApprovalStage::SendingNotification { code });
                Transition::Accepted
            }
            "Approved" => {
                self.stage = Some(ApprovalStage::Approved);
                Transition::Accepted
            }
            "Rejected" => {
                self.stage = Some(ApprovalStage::Rejected);
                Transition::Accepted
            }
            _ => Transition::Ignored,
        }
    }

    fn effect(&mut self, deps: &Self::Deps, recovering: bool) -> Vec<CommandEnvelope> {
        match self.stage.clone() {
            // Generate once per pipeline run; the stage only leaves
            // GeneratingCode when the ApprovalCodeSet event comes back.
            Some(ApprovalStage::GeneratingCode) if self.approval_code.is_none() => {
                let code = deps.codes.generate();
                self.approval_code = Some(code.clone());
                self.command_envelope(&DocumentCommand::SetApprovalCode { code })
                    .into_iter()
                    .collect()
            }
            Some(ApprovalStage::SendingNotification { code }) => {
                // The notification is the one effect that must not fire
                // again on replay.
                if !recovering {
                    deps.notifier.notify(&self.document_id, &code);
                }
                self.stage = Some(ApprovalStage::WaitingForApproval { code });
                Vec::new()
            }
            Some(ApprovalStage::WaitingForApproval { .. }) => self
                .command_envelope(&DocumentCommand::Approve)
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.stage,
            Some(ApprovalStage::Approved) | Some(ApprovalStage::Rejected)
        )
    }
}

fn code_from_payload(payload: &Value) -> Option<String> {
    payload.get("code")?.as_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(instance_id: &str, event_type: &str, payload: Value) -> Recorded {
        Recorded {
            sequence: 1,
            aggregate_type: "document".to_string(),
            instance_id: instance_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            correlation_id: None,
            actor: None,
            recorded_at: chrono::Utc::now(),
        }
    }

    struct FixedCodes;

    impl CodeGenerator for FixedCodes {
        fn generate(&self) -> String {
            "123456".to_string()
        }
    }

    struct SilentNotifier;

    impl Notifier for SilentNotifier {
        fn notify(&self, _document_id: &str, _code: &str) {}
    }

    fn fixed_deps() -> ApprovalDeps {
        ApprovalDeps {
            notifier: Arc::new(SilentNotifier),
            codes: Arc::new(FixedCodes),
        }
    }

    #[test]
    fn created_event_enters_generating_code() {
        let mut saga = ApprovalSaga::default();
        let outcome = saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));

        assert_eq!(outcome, Transition::Accepted);
        assert_eq!(saga.stage(), Some(&ApprovalStage::GeneratingCode));
    }

    #[test]
    fn generating_code_effect_emits_set_approval_code_once() {
        let mut saga = ApprovalSaga::default();
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));

        let deps = fixed_deps();
        let first = saga.effect(&deps, false);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].command["type"], "SetApprovalCode");
        assert_eq!(first[0].command["data"]["code"], "123456");
        assert_eq!(first[0].context.actor.as_deref(), Some(SAGA_ACTOR));

        // The code is already out; re-running the effect is a no-op.
        assert!(saga.effect(&deps, false).is_empty());
    }

    #[test]
    fn approval_code_set_moves_to_sending_notification() {
        let mut saga = ApprovalSaga::default();
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));

        let outcome = saga.transition(&event("d-1", "ApprovalCodeSet", json!({"code": "123456"})));
        assert_eq!(outcome, Transition::Accepted);
        assert_eq!(
            saga.stage(),
            Some(&ApprovalStage::SendingNotification { code: "123456".to_string() })
        );
    }

    #[test]
    fn approval_code_set_out_of_stage_is_ignored() {
        let mut saga = ApprovalSaga::default();
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));
        saga.transition(&event("d-1", "ApprovalCodeSet", json!({"code": "123456"})));
        saga.effect(&fixed_deps(), false);

        // A second code event while waiting for approval changes nothing.
        let outcome = saga.transition(&event("d-1", "ApprovalCodeSet", json!({"code": "999999"})));
        assert_eq!(outcome, Transition::Ignored);
        assert_eq!(
            saga.stage(),
            Some(&ApprovalStage::WaitingForApproval { code: "123456".to_string() })
        );
    }

    #[test]
    fn malformed_code_payload_is_ignored() {
        let mut saga = ApprovalSaga::default();
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));

        let outcome = saga.transition(&event("d-1", "ApprovalCodeSet", json!({"code": 123456})));
        assert_eq!(outcome, Transition::Ignored);
        assert_eq!(saga.stage(), Some(&ApprovalStage::GeneratingCode));
    }

    #[test]
    fn notification_gated_during_recovery() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct Counting(AtomicUsize);
        impl Notifier for Counting {
            fn notify(&self, _document_id: &str, _code: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let notifier = Arc::new(Counting::default());
        let deps = ApprovalDeps {
            notifier: notifier.clone(),
            codes: Arc::new(FixedCodes),
        };

        let mut saga = ApprovalSaga::default();
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));
        saga.transition(&event("d-1", "ApprovalCodeSet", json!({"code": "123456"})));

        saga.effect(&deps, true);
        assert_eq!(notifier.0.load(Ordering::SeqCst), 0);
        assert_eq!(
            saga.stage(),
            Some(&ApprovalStage::WaitingForApproval { code: "123456".to_string() })
        );
    }

    #[test]
    fn waiting_effect_issues_approve_command() {
        let mut saga = ApprovalSaga::default();
        let deps = fixed_deps();
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));
        saga.transition(&event("d-1", "ApprovalCodeSet", json!({"code": "123456"})));
        saga.effect(&deps, false);

        let envelopes = saga.effect(&deps, false);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].command["type"], "Approve");
        assert_eq!(envelopes[0].instance_id, "d-1");
    }

    #[test]
    fn approved_from_any_stage_is_terminal() {
        let mut saga = ApprovalSaga::default();
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));

        let outcome = saga.transition(&event("d-1", "Approved", Value::Null));
        assert_eq!(outcome, Transition::Accepted);
        assert!(saga.is_terminal());
        assert!(saga.effect(&fixed_deps(), false).is_empty());
    }

    #[test]
    fn rejected_is_terminal() {
        let mut saga = ApprovalSaga::default();
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));
        saga.transition(&event("d-1", "Rejected", Value::Null));

        assert!(saga.is_terminal());
    }

    #[test]
    fn update_restarts_pipeline_for_approved_document() {
        let mut saga = ApprovalSaga::default();
        let deps = fixed_deps();
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));
        saga.effect(&deps, false);
        saga.transition(&event("d-1", "ApprovalCodeSet", json!({"code": "123456"})));
        saga.effect(&deps, false);
        saga.transition(&event("d-1", "Approved", Value::Null));

        // A new edit arrives; the pipeline starts over and a fresh code
        // must be generated.
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));
        assert_eq!(saga.stage(), Some(&ApprovalStage::GeneratingCode));
    }

    #[test]
    fn edit_mid_review_restarts_with_a_fresh_code() {
        let mut saga = ApprovalSaga::default();
        let deps = fixed_deps();
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));
        saga.effect(&deps, false);
        saga.transition(&event("d-1", "ApprovalCodeSet", json!({"code": "123456"})));
        saga.effect(&deps, false);
        assert_eq!(
            saga.stage(),
            Some(&ApprovalStage::WaitingForApproval { code: "123456".to_string() })
        );

        // A new revision lands while the previous one is still under
        // review: back to the start, and a new code goes out.
        saga.transition(&event("d-1", "CreatedOrUpdated", json!({})));
        assert_eq!(saga.stage(), Some(&ApprovalStage::GeneratingCode));

        let envelopes = saga.effect(&deps, false);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].command["type"], "SetApprovalCode");
    }

    #[test]
    fn random_codes_are_six_digits() {
        let generator = RandomCodeGenerator;
        for _ in 0..32 {
            let code = generator.generate();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
