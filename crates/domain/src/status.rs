//! Delivery order lifecycle as observed locally.
//!
//! `created -> submitted -> accepted -> picked_up -> delivering -> completed`,
//! with `cancelled` reachable from every non-terminal state and `rejected`
//! reachable only from `submitted`. Forward moves may skip intermediate states
//! because platforms drop or reorder callbacks; backward moves never happen.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Created,
    Submitted,
    Accepted,
    PickedUp,
    Delivering,
    Completed,
    Cancelled,
    Rejected,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Created => "created",
            DeliveryStatus::Submitted => "submitted",
            DeliveryStatus::Accepted => "accepted",
            DeliveryStatus::PickedUp => "picked_up",
            DeliveryStatus::Delivering => "delivering",
            DeliveryStatus::Completed => "completed",
            DeliveryStatus::Cancelled => "cancelled",
            DeliveryStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Completed | DeliveryStatus::Cancelled | DeliveryStatus::Rejected
        )
    }

    /// Transition table. Both the dispatcher and the callback/query paths consult
    /// this and nothing else.
    pub fn allowed_next(&self) -> &'static [DeliveryStatus] {
        use DeliveryStatus::*;
        match self {
            Created => &[Submitted, Cancelled],
            Submitted => &[Accepted, PickedUp, Delivering, Completed, Cancelled, Rejected],
            Accepted => &[PickedUp, Delivering, Completed, Cancelled],
            PickedUp => &[Delivering, Completed, Cancelled],
            Delivering => &[Completed, Cancelled],
            Completed | Cancelled | Rejected => &[],
        }
    }

    pub fn can_transition(&self, to: DeliveryStatus) -> bool {
        self.allowed_next().contains(&to)
    }

    /// Map a platform's status label (string name or numeric code) to the local enum.
    pub fn from_remote(label: &str) -> Option<DeliveryStatus> {
        let label = label.trim().to_ascii_lowercase();
        let status = match label.as_str() {
            "0" | "pending" | "created" | "waiting" => DeliveryStatus::Submitted,
            // Rider at the shop or the kitchen still working: accepted, not yet picked up.
            "1" | "accepted" | "confirmed" | "arrived_shop" | "preparing" | "prepared" => DeliveryStatus::Accepted,
            "2" | "picked_up" | "picked" => DeliveryStatus::PickedUp,
            "delivering" | "in_delivery" => DeliveryStatus::Delivering,
            "3" | "delivered" | "arrived" | "completed" => DeliveryStatus::Completed,
            "4" | "cancelled" | "canceled" => DeliveryStatus::Cancelled,
            "rejected" | "refused" => DeliveryStatus::Rejected,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown delivery status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for DeliveryStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(DeliveryStatus::Created),
            "submitted" => Ok(DeliveryStatus::Submitted),
            "accepted" => Ok(DeliveryStatus::Accepted),
            "picked_up" => Ok(DeliveryStatus::PickedUp),
            "delivering" => Ok(DeliveryStatus::Delivering),
            "completed" => Ok(DeliveryStatus::Completed),
            "cancelled" => Ok(DeliveryStatus::Cancelled),
            "rejected" => Ok(DeliveryStatus::Rejected),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DeliveryStatus::{self, *};
    use super::UnknownStatus;

    const ALL: [DeliveryStatus; 8] = [
        Created, Submitted, Accepted, PickedUp, Delivering, Completed, Cancelled, Rejected,
    ];

    #[test]
    fn happy_path_is_allowed() {
        assert!(Created.can_transition(Submitted));
        assert!(Submitted.can_transition(Accepted));
        assert!(Accepted.can_transition(PickedUp));
        assert!(PickedUp.can_transition(Delivering));
        assert!(Delivering.can_transition(Completed));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [Completed, Cancelled, Rejected] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition(to), "{from} -> {to} must be refused");
            }
        }
    }

    #[test]
    fn never_moves_backwards_or_to_self() {
        assert!(!Completed.can_transition(Accepted));
        assert!(!Delivering.can_transition(PickedUp));
        assert!(!Accepted.can_transition(Submitted));
        for s in ALL {
            assert!(!s.can_transition(s), "{s} -> {s} must be refused");
        }
    }

    #[test]
    fn cancel_from_any_non_terminal() {
        for from in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition(Cancelled), "{from} -> cancelled");
        }
    }

    #[test]
    fn reject_only_from_submitted() {
        for from in ALL {
            assert_eq!(from.can_transition(Rejected), from == Submitted, "{from} -> rejected");
        }
    }

    #[test]
    fn remote_vocabulary() {
        assert_eq!(DeliveryStatus::from_remote("0"), Some(Submitted));
        assert_eq!(DeliveryStatus::from_remote("pending"), Some(Submitted));
        assert_eq!(DeliveryStatus::from_remote("ACCEPTED"), Some(Accepted));
        assert_eq!(DeliveryStatus::from_remote("2"), Some(PickedUp));
        assert_eq!(DeliveryStatus::from_remote("delivered"), Some(Completed));
        assert_eq!(DeliveryStatus::from_remote("canceled"), Some(Cancelled));
        assert_eq!(DeliveryStatus::from_remote("arrived_shop"), Some(Accepted));
        assert_eq!(DeliveryStatus::from_remote("preparing"), Some(Accepted));
        assert_eq!(DeliveryStatus::from_remote("prepared"), Some(Accepted));
        assert_eq!(DeliveryStatus::from_remote("arrived"), Some(Completed));
        assert_eq!(DeliveryStatus::from_remote("teleported"), None);
    }

    #[test]
    fn local_names_round_trip() {
        for s in ALL {
            assert_eq!(s.as_str().parse::<DeliveryStatus>(), Ok(s));
        }
        let err = "sent".parse::<DeliveryStatus>().unwrap_err();
        assert_eq!(err, UnknownStatus("sent".into()));
        assert_eq!(err.to_string(), "unknown delivery status: sent");
    }
}
