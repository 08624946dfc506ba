//! Local swap state machine
//!
//! The local status of a swap record is an explicit tagged set. Transitions
//! form a finite directed graph whose only back-edge is the Retry transition
//! from a FailedTo* node to its declared retry target; the retry target is a
//! lookup table, never ordinal arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwapState {
    /// Record created by the order maker; the secret is known locally
    Created,
    /// Record created by the order taker; only the hash is known
    Filled,
    InitiatorInitiated,
    InitiatorFailedToInitiate,
    InitiatorRedeemed,
    InitiatorFailedToRedeem,
    InitiatorRefunded,
    InitiatorFailedToRefund,
    FollowerInitiated,
    FollowerFailedToInitiate,
    FollowerRedeemed,
    FollowerFailedToRedeem,
    FollowerRefunded,
    FollowerFailedToRefund,
}

use SwapState::*;

impl SwapState {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            InitiatorFailedToInitiate
                | InitiatorFailedToRedeem
                | InitiatorFailedToRefund
                | FollowerFailedToInitiate
                | FollowerFailedToRedeem
                | FollowerFailedToRefund
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InitiatorRedeemed | InitiatorRefunded | FollowerRedeemed | FollowerRefunded
        )
    }

    /// The pre-failure state a FailedTo* status rolls back to on Retry.
    ///
    /// A failed initiate returns to the record's starting point (Created for
    /// the maker, Filled for the taker); failed redeems and refunds return to
    /// the Initiated state the actor held before attempting the action.
    pub fn retry_target(self) -> Option<SwapState> {
        match self {
            InitiatorFailedToInitiate => Some(Created),
            FollowerFailedToInitiate => Some(Filled),
            InitiatorFailedToRedeem => Some(InitiatorInitiated),
            InitiatorFailedToRefund => Some(InitiatorInitiated),
            FollowerFailedToRedeem => Some(FollowerInitiated),
            FollowerFailedToRefund => Some(FollowerInitiated),
            _ => None,
        }
    }

    /// The success state a FailedTo* status promotes to when recovery finds
    /// the supposedly-failed transaction landed on-chain.
    pub fn promotion_target(self) -> Option<SwapState> {
        match self {
            InitiatorFailedToInitiate => Some(InitiatorInitiated),
            FollowerFailedToInitiate => Some(FollowerInitiated),
            InitiatorFailedToRedeem => Some(InitiatorRedeemed),
            FollowerFailedToRedeem => Some(FollowerRedeemed),
            InitiatorFailedToRefund => Some(InitiatorRefunded),
            FollowerFailedToRefund => Some(FollowerRefunded),
            _ => None,
        }
    }

    /// The order side this state belongs to; None for the two entry states.
    pub fn role(self) -> Option<Role> {
        match self {
            Created | Filled => None,
            InitiatorInitiated | InitiatorFailedToInitiate | InitiatorRedeemed
            | InitiatorFailedToRedeem | InitiatorRefunded | InitiatorFailedToRefund => {
                Some(Role::Initiator)
            }
            FollowerInitiated | FollowerFailedToInitiate | FollowerRedeemed
            | FollowerFailedToRedeem | FollowerRefunded | FollowerFailedToRefund => {
                Some(Role::Follower)
            }
        }
    }

    /// The chain action a FailedTo* state records the failure of
    pub fn failed_action(self) -> Option<crate::backend::ActionKind> {
        use crate::backend::ActionKind;
        match self {
            InitiatorFailedToInitiate | FollowerFailedToInitiate => Some(ActionKind::Initiate),
            InitiatorFailedToRedeem | FollowerFailedToRedeem => Some(ActionKind::Redeem),
            InitiatorFailedToRefund | FollowerFailedToRefund => Some(ActionKind::Refund),
            _ => None,
        }
    }

    /// Legal forward transitions. Retry is handled separately and is the
    /// only edge that moves backwards.
    pub fn can_transition_to(self, next: SwapState) -> bool {
        match self {
            Created => matches!(next, InitiatorInitiated | InitiatorFailedToInitiate),
            Filled => matches!(next, FollowerInitiated | FollowerFailedToInitiate),
            InitiatorInitiated => matches!(
                next,
                InitiatorRedeemed
                    | InitiatorFailedToRedeem
                    | InitiatorRefunded
                    | InitiatorFailedToRefund
            ),
            FollowerInitiated => matches!(
                next,
                FollowerRedeemed
                    | FollowerFailedToRedeem
                    | FollowerRefunded
                    | FollowerFailedToRefund
            ),
            // Promotion edge: recovery observed the failed action on-chain
            s if s.is_failure() => s.promotion_target() == Some(next),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Created => "created",
            Filled => "filled",
            InitiatorInitiated => "initiator_initiated",
            InitiatorFailedToInitiate => "initiator_failed_to_initiate",
            InitiatorRedeemed => "initiator_redeemed",
            InitiatorFailedToRedeem => "initiator_failed_to_redeem",
            InitiatorRefunded => "initiator_refunded",
            InitiatorFailedToRefund => "initiator_failed_to_refund",
            FollowerInitiated => "follower_initiated",
            FollowerFailedToInitiate => "follower_failed_to_initiate",
            FollowerRedeemed => "follower_redeemed",
            FollowerFailedToRedeem => "follower_failed_to_redeem",
            FollowerRefunded => "follower_refunded",
            FollowerFailedToRefund => "follower_failed_to_refund",
        }
    }

    pub fn parse(s: &str) -> Option<SwapState> {
        Some(match s {
            "created" => Created,
            "filled" => Filled,
            "initiator_initiated" => InitiatorInitiated,
            "initiator_failed_to_initiate" => InitiatorFailedToInitiate,
            "initiator_redeemed" => InitiatorRedeemed,
            "initiator_failed_to_redeem" => InitiatorFailedToRedeem,
            "initiator_refunded" => InitiatorRefunded,
            "initiator_failed_to_refund" => InitiatorFailedToRefund,
            "follower_initiated" => FollowerInitiated,
            "follower_failed_to_initiate" => FollowerFailedToInitiate,
            "follower_redeemed" => FollowerRedeemed,
            "follower_failed_to_redeem" => FollowerFailedToRedeem,
            "follower_refunded" => FollowerRefunded,
            "follower_failed_to_refund" => FollowerFailedToRefund,
            _ => return None,
        })
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the order this signer is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Follower,
}

impl Role {
    pub fn initiated(self) -> SwapState {
        match self {
            Role::Initiator => InitiatorInitiated,
            Role::Follower => FollowerInitiated,
        }
    }

    pub fn failed_to_initiate(self) -> SwapState {
        match self {
            Role::Initiator => InitiatorFailedToInitiate,
            Role::Follower => FollowerFailedToInitiate,
        }
    }

    pub fn redeemed(self) -> SwapState {
        match self {
            Role::Initiator => InitiatorRedeemed,
            Role::Follower => FollowerRedeemed,
        }
    }

    pub fn failed_to_redeem(self) -> SwapState {
        match self {
            Role::Initiator => InitiatorFailedToRedeem,
            Role::Follower => FollowerFailedToRedeem,
        }
    }

    pub fn refunded(self) -> SwapState {
        match self {
            Role::Initiator => InitiatorRefunded,
            Role::Follower => FollowerRefunded,
        }
    }

    pub fn failed_to_refund(self) -> SwapState {
        match self {
            Role::Initiator => InitiatorFailedToRefund,
            Role::Follower => FollowerFailedToRefund,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Follower => f.write_str("follower"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SwapState; 14] = [
        Created,
        Filled,
        InitiatorInitiated,
        InitiatorFailedToInitiate,
        InitiatorRedeemed,
        InitiatorFailedToRedeem,
        InitiatorRefunded,
        InitiatorFailedToRefund,
        FollowerInitiated,
        FollowerFailedToInitiate,
        FollowerRedeemed,
        FollowerFailedToRedeem,
        FollowerRefunded,
        FollowerFailedToRefund,
    ];

    #[test]
    fn state_string_round_trip() {
        for state in ALL {
            assert_eq!(SwapState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SwapState::parse("bogus"), None);
    }

    #[test]
    fn every_failure_has_a_retry_target() {
        for state in ALL {
            assert_eq!(state.retry_target().is_some(), state.is_failure());
            assert_eq!(state.promotion_target().is_some(), state.is_failure());
        }
    }

    #[test]
    fn retry_targets_match_pre_failure_states() {
        assert_eq!(InitiatorFailedToInitiate.retry_target(), Some(Created));
        assert_eq!(FollowerFailedToInitiate.retry_target(), Some(Filled));
        assert_eq!(
            InitiatorFailedToRedeem.retry_target(),
            Some(InitiatorInitiated)
        );
        assert_eq!(
            InitiatorFailedToRefund.retry_target(),
            Some(InitiatorInitiated)
        );
        assert_eq!(
            FollowerFailedToRefund.retry_target(),
            Some(FollowerInitiated)
        );
    }

    #[test]
    fn terminal_states_have_no_forward_edges() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn failure_states_only_promote_forward() {
        for from in ALL.into_iter().filter(|s| s.is_failure()) {
            for to in ALL {
                let legal = from.can_transition_to(to);
                assert_eq!(legal, from.promotion_target() == Some(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn roles_never_cross() {
        assert!(Created.can_transition_to(InitiatorInitiated));
        assert!(!Created.can_transition_to(FollowerInitiated));
        assert!(Filled.can_transition_to(FollowerFailedToInitiate));
        assert!(!Filled.can_transition_to(InitiatorInitiated));
        assert!(!InitiatorInitiated.can_transition_to(FollowerRedeemed));
    }
}
