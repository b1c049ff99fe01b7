use serde::{Deserialize, Serialize};

use crate::domain::approval::Stage;
use crate::domain::request::{RequestState, RequestType};
use crate::domain::user::Role;
use crate::workflow::states::WorkflowAction;

/// How submitted project requests are routed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectRouting {
    /// Projects go straight from SUBMITTED to the final manager.
    #[default]
    Direct,
    /// Projects follow the purchase pipeline (DM, then ACCT, then FINAL).
    Standard,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub can_approve: bool,
    pub can_reject: bool,
    pub can_upload_quote: bool,
    pub can_select_quote: bool,
    pub can_transfer_funds: bool,
}

impl Permissions {
    pub const NONE: Permissions = Permissions {
        can_approve: false,
        can_reject: false,
        can_upload_quote: false,
        can_select_quote: false,
        can_transfer_funds: false,
    };

    const DECIDE: Permissions =
        Permissions { can_approve: true, can_reject: true, ..Permissions::NONE };

    pub fn allows(&self, action: WorkflowAction) -> bool {
        match action {
            WorkflowAction::Approve => self.can_approve,
            WorkflowAction::Reject => self.can_reject,
            WorkflowAction::UploadQuote => self.can_upload_quote,
            WorkflowAction::SelectQuote => self.can_select_quote,
            WorkflowAction::TransferFunds => self.can_transfer_funds,
            WorkflowAction::Submit => false,
        }
    }

    pub fn any(&self) -> bool {
        self.can_approve
            || self.can_reject
            || self.can_upload_quote
            || self.can_select_quote
            || self.can_transfer_funds
    }
}

/// The single authorization table for the approval pipeline.
///
/// Authorization is a function of state, role and request type only. The
/// request's `current_approver_id` is a routing hint and never consulted here,
/// so any holder of the stage role may act (pooled approvers).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPolicy {
    pub project_routing: ProjectRouting,
    pub accountant_can_reject: bool,
}

impl WorkflowPolicy {
    /// The stage whose decision the request is waiting on, if any.
    pub fn stage_for(&self, state: RequestState, request_type: RequestType) -> Option<Stage> {
        match state {
            RequestState::Submitted if self.routes_directly(request_type) => Some(Stage::Final),
            RequestState::Submitted => Some(Stage::Dm),
            RequestState::DmApproved => Some(Stage::Acct),
            RequestState::AcctApproved => Some(Stage::Final),
            _ => None,
        }
    }

    pub fn can_act(&self, state: RequestState, role: Role, request_type: RequestType) -> Permissions {
        let stage = self.stage_for(state, request_type);

        match (state, role, stage) {
            (RequestState::Submitted, Role::DirectManager, Some(Stage::Dm)) => Permissions::DECIDE,
            (RequestState::Submitted, Role::FinalManager, Some(Stage::Final)) => {
                Permissions::DECIDE
            }
            (RequestState::DmApproved, Role::Accountant, _) => Permissions {
                can_approve: true,
                can_reject: self.accountant_can_reject,
                can_upload_quote: true,
                can_select_quote: true,
                can_transfer_funds: false,
            },
            (RequestState::AcctApproved, Role::FinalManager, _) => Permissions::DECIDE,
            (RequestState::FinalApproved, Role::Accountant, _) => {
                Permissions { can_transfer_funds: true, ..Permissions::NONE }
            }
            _ => Permissions::NONE,
        }
    }

    /// Next state for a decision taken at `state`, or `None` if the pair has no
    /// entry in the transition table.
    pub fn next_state(
        &self,
        state: RequestState,
        action: WorkflowAction,
        request_type: RequestType,
    ) -> Option<RequestState> {
        let stage = self.stage_for(state, request_type);
        match (stage, state, action) {
            (_, RequestState::Draft, WorkflowAction::Submit) => Some(RequestState::Submitted),
            (Some(Stage::Dm), _, WorkflowAction::Approve) => Some(RequestState::DmApproved),
            (Some(Stage::Dm), _, WorkflowAction::Reject) => Some(RequestState::DmRejected),
            (Some(Stage::Acct), _, WorkflowAction::Approve) => Some(RequestState::AcctApproved),
            (Some(Stage::Acct), _, WorkflowAction::Reject) => Some(RequestState::AcctRejected),
            (Some(Stage::Final), _, WorkflowAction::Approve) => Some(RequestState::FinalApproved),
            (Some(Stage::Final), _, WorkflowAction::Reject) => Some(RequestState::FinalRejected),
            (None, RequestState::FinalApproved, WorkflowAction::TransferFunds) => {
                Some(RequestState::FundsTransferred)
            }
            _ => None,
        }
    }

    /// Whether a request sits in `role`'s queue of pending work.
    pub fn is_pending_for(&self, state: RequestState, role: Role, request_type: RequestType) -> bool {
        let permissions = self.can_act(state, role, request_type);
        permissions.can_approve || permissions.can_reject || permissions.can_transfer_funds
    }

    fn routes_directly(&self, request_type: RequestType) -> bool {
        request_type == RequestType::Project && self.project_routing == ProjectRouting::Direct
    }
}

#[cfg(test)]
mod tests {
    use super::{Permissions, ProjectRouting, WorkflowPolicy};
    use crate::domain::approval::Stage;
    use crate::domain::request::{RequestState, RequestType};
    use crate::domain::user::Role;
    use crate::workflow::states::WorkflowAction;

    fn perms(approve: bool, reject: bool, upload: bool, select: bool, transfer: bool) -> Permissions {
        Permissions {
            can_approve: approve,
            can_reject: reject,
            can_upload_quote: upload,
            can_select_quote: select,
            can_transfer_funds: transfer,
        }
    }

    fn expected_purchase(state: RequestState, role: Role) -> Permissions {
        use RequestState::*;
        use Role::*;
        match (state, role) {
            (Submitted, DirectManager) => perms(true, true, false, false, false),
            (DmApproved, Accountant) => perms(true, false, true, true, false),
            (AcctApproved, FinalManager) => perms(true, true, false, false, false),
            (FinalApproved, Accountant) => perms(false, false, false, false, true),
            _ => Permissions::NONE,
        }
    }

    #[test]
    fn purchase_table_matches_for_every_state_and_role() {
        let policy = WorkflowPolicy::default();
        for state in RequestState::ALL {
            for role in Role::ALL {
                assert_eq!(
                    policy.can_act(state, role, RequestType::Purchase),
                    expected_purchase(state, role),
                    "unexpected permissions for {state} / {role}"
                );
            }
        }
    }

    #[test]
    fn directly_routed_projects_go_to_the_final_manager() {
        let policy = WorkflowPolicy::default();
        for state in RequestState::ALL {
            for role in Role::ALL {
                let expected = match (state, role) {
                    (RequestState::Submitted, Role::FinalManager) => {
                        perms(true, true, false, false, false)
                    }
                    (RequestState::Submitted, Role::DirectManager) => Permissions::NONE,
                    _ => expected_purchase(state, role),
                };
                assert_eq!(
                    policy.can_act(state, role, RequestType::Project),
                    expected,
                    "unexpected project permissions for {state} / {role}"
                );
            }
        }
        assert_eq!(
            policy.next_state(RequestState::Submitted, WorkflowAction::Approve, RequestType::Project),
            Some(RequestState::FinalApproved)
        );
    }

    #[test]
    fn standard_project_routing_matches_purchase_table() {
        let policy =
            WorkflowPolicy { project_routing: ProjectRouting::Standard, ..WorkflowPolicy::default() };
        for state in RequestState::ALL {
            for role in Role::ALL {
                assert_eq!(
                    policy.can_act(state, role, RequestType::Project),
                    expected_purchase(state, role)
                );
            }
        }
    }

    #[test]
    fn terminal_states_grant_nothing() {
        let policy = WorkflowPolicy { accountant_can_reject: true, ..WorkflowPolicy::default() };
        for state in RequestState::ALL.into_iter().filter(RequestState::is_terminal) {
            for role in Role::ALL {
                for request_type in [RequestType::Purchase, RequestType::Project] {
                    assert!(!policy.can_act(state, role, request_type).any());
                }
            }
        }
    }

    #[test]
    fn accountant_reject_is_a_policy_switch() {
        let closed = WorkflowPolicy::default();
        let open = WorkflowPolicy { accountant_can_reject: true, ..WorkflowPolicy::default() };

        assert!(!closed.can_act(RequestState::DmApproved, Role::Accountant, RequestType::Purchase).can_reject);
        assert!(open.can_act(RequestState::DmApproved, Role::Accountant, RequestType::Purchase).can_reject);
        assert_eq!(
            open.next_state(RequestState::DmApproved, WorkflowAction::Reject, RequestType::Purchase),
            Some(RequestState::AcctRejected)
        );
    }

    #[test]
    fn stages_follow_the_pipeline() {
        let policy = WorkflowPolicy::default();
        assert_eq!(policy.stage_for(RequestState::Submitted, RequestType::Purchase), Some(Stage::Dm));
        assert_eq!(policy.stage_for(RequestState::DmApproved, RequestType::Purchase), Some(Stage::Acct));
        assert_eq!(
            policy.stage_for(RequestState::AcctApproved, RequestType::Purchase),
            Some(Stage::Final)
        );
        assert_eq!(policy.stage_for(RequestState::FinalApproved, RequestType::Purchase), None);
        assert_eq!(policy.stage_for(RequestState::Draft, RequestType::Purchase), None);
    }

    #[test]
    fn pending_queue_excludes_upload_only_access() {
        let policy = WorkflowPolicy::default();
        assert!(policy.is_pending_for(RequestState::DmApproved, Role::Accountant, RequestType::Purchase));
        assert!(policy.is_pending_for(RequestState::FinalApproved, Role::Accountant, RequestType::Purchase));
        assert!(!policy.is_pending_for(RequestState::Submitted, Role::Accountant, RequestType::Purchase));
        assert!(!policy.is_pending_for(RequestState::Submitted, Role::Admin, RequestType::Purchase));
    }
}
