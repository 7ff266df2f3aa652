//! Canonical enums for cases, dispatch rows, tokens and the delivery log.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Case lifecycle
// ============================================================================

/// Lifecycle of a case (appointment) awaiting a vet.
///
/// OPEN is the only non-terminal state. Every transition out of OPEN is a
/// conditional write against the case row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    #[default]
    Open,
    Assigned,
    Expired,
    Cancelled,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Open => "OPEN",
            CaseStatus::Assigned => "ASSIGNED",
            CaseStatus::Expired => "EXPIRED",
            CaseStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CaseStatus::Open)
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(CaseStatus::Open),
            "ASSIGNED" => Ok(CaseStatus::Assigned),
            "EXPIRED" => Ok(CaseStatus::Expired),
            "CANCELLED" | "CANCELED" => Ok(CaseStatus::Cancelled),
            _ => Err(format!("Invalid case status: '{}'", s)),
        }
    }
}

/// Status of one (case, candidate) dispatch row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandidateStatus {
    /// Notified and has not responded yet
    #[default]
    Notified,
    /// Won the claim race
    Accepted,
    /// Said no; never becomes LOST
    Declined,
    /// Another candidate won the claim race
    Lost,
    /// Case expired or was cancelled before this candidate responded
    Expired,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Notified => "NOTIFIED",
            CandidateStatus::Accepted => "ACCEPTED",
            CandidateStatus::Declined => "DECLINED",
            CandidateStatus::Lost => "LOST",
            CandidateStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CandidateStatus::Notified)
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CandidateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NOTIFIED" => Ok(CandidateStatus::Notified),
            "ACCEPTED" => Ok(CandidateStatus::Accepted),
            "DECLINED" => Ok(CandidateStatus::Declined),
            "LOST" => Ok(CandidateStatus::Lost),
            "EXPIRED" => Ok(CandidateStatus::Expired),
            _ => Err(format!("Invalid candidate status: '{}'", s)),
        }
    }
}

/// What a response link does when redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Accept,
    Decline,
}

impl ActionKind {
    pub const ALL: [ActionKind; 2] = [ActionKind::Accept, ActionKind::Decline];

    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Accept => "ACCEPT",
            ActionKind::Decline => "DECLINE",
        }
    }

    /// Value of the `action=` query parameter in response links.
    pub fn as_query_value(&self) -> &'static str {
        match self {
            ActionKind::Accept => "accept",
            ActionKind::Decline => "decline",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ACCEPT" => Ok(ActionKind::Accept),
            "DECLINE" => Ok(ActionKind::Decline),
            _ => Err(format!(
                "Invalid action: '{}'. Expected: accept or decline",
                s
            )),
        }
    }
}

/// Visit or call type requested by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsultationKind {
    #[default]
    Physical,
    Virtual,
    /// Government or NGO subsidized visit
    Subsidized,
}

impl ConsultationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsultationKind::Physical => "physical",
            ConsultationKind::Virtual => "virtual",
            ConsultationKind::Subsidized => "subsidized",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConsultationKind::Physical => "Physical visit",
            ConsultationKind::Virtual => "Virtual consultation",
            ConsultationKind::Subsidized => "Subsidized visit",
        }
    }
}

impl fmt::Display for ConsultationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConsultationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "physical" => Ok(ConsultationKind::Physical),
            "virtual" | "online" => Ok(ConsultationKind::Virtual),
            "subsidized" | "subsidised" => Ok(ConsultationKind::Subsidized),
            _ => Err(format!("Invalid consultation kind: '{}'", s)),
        }
    }
}

// ============================================================================
// Delivery log
// ============================================================================

/// Delivery state of one logged notification. PENDING is written before the
/// send attempt; SENT and FAILED are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "SENT" => Ok(DeliveryStatus::Sent),
            "FAILED" => Ok(DeliveryStatus::Failed),
            _ => Err(format!("Invalid delivery status: '{}'", s)),
        }
    }
}

/// Which message a log row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    InitialNotification,
    AcceptanceConfirmation,
    CaseTaken,
    Other,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::InitialNotification => "initial-notification",
            MessageKind::AcceptanceConfirmation => "acceptance-confirmation",
            MessageKind::CaseTaken => "case-taken",
            MessageKind::Other => "other",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "initial-notification" => Ok(MessageKind::InitialNotification),
            "acceptance-confirmation" => Ok(MessageKind::AcceptanceConfirmation),
            "case-taken" => Ok(MessageKind::CaseTaken),
            "other" => Ok(MessageKind::Other),
            _ => Err(format!("Invalid message kind: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecipientType {
    Candidate,
    CaseOwner,
}

impl RecipientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientType::Candidate => "candidate",
            RecipientType::CaseOwner => "case-owner",
        }
    }
}

impl fmt::Display for RecipientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecipientType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "candidate" => Ok(RecipientType::Candidate),
            "case-owner" | "owner" => Ok(RecipientType::CaseOwner),
            _ => Err(format!("Invalid recipient type: '{}'", s)),
        }
    }
}

// ============================================================================
// Response outcomes
// ============================================================================

/// Result of redeeming a response link.
///
/// None of these are errors: lost races, replays and bad links are expected
/// outcomes of the broadcast protocol and render as a normal page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseOutcome {
    /// This redemption won the claim
    Assigned,
    /// Fresh decline recorded
    Declined,
    /// Replay by the candidate who already won
    AlreadyAccepted,
    /// The case closed without this candidate
    AlreadyLost,
    /// The candidate already declined
    AlreadyDeclined,
    /// Fresh accept that arrived after another candidate won
    CaseAlreadyAssigned,
    /// Unknown token, or token used on the wrong case/action
    InvalidLink,
}

impl ResponseOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            ResponseOutcome::Assigned => "ASSIGNED",
            ResponseOutcome::Declined => "DECLINED",
            ResponseOutcome::AlreadyAccepted => "ALREADY_ACCEPTED",
            ResponseOutcome::AlreadyLost => "ALREADY_LOST",
            ResponseOutcome::AlreadyDeclined => "ALREADY_DECLINED",
            ResponseOutcome::CaseAlreadyAssigned => "CASE_ALREADY_ASSIGNED",
            ResponseOutcome::InvalidLink => "INVALID_LINK",
        }
    }

    /// True only for the single redemption that assigned the case.
    pub fn is_assignment(&self) -> bool {
        matches!(self, ResponseOutcome::Assigned)
    }

    pub fn headline(&self) -> &'static str {
        match self {
            ResponseOutcome::Assigned => "The case is yours",
            ResponseOutcome::Declined => "Thanks for letting us know",
            ResponseOutcome::AlreadyAccepted => "You already accepted this case",
            ResponseOutcome::AlreadyLost => "This case is no longer available",
            ResponseOutcome::AlreadyDeclined => "You already declined this case",
            ResponseOutcome::CaseAlreadyAssigned => "Another vet accepted this case first",
            ResponseOutcome::InvalidLink => "This link is not valid",
        }
    }

    pub fn detail(&self) -> &'static str {
        match self {
            ResponseOutcome::Assigned => {
                "A confirmation email with the owner's contact details is on its way."
            }
            ResponseOutcome::Declined => "We will not assign this case to you.",
            ResponseOutcome::AlreadyAccepted => {
                "Check your inbox for the confirmation email with the owner's details."
            }
            ResponseOutcome::AlreadyLost => {
                "The case was closed or handed to another vet. No action is needed."
            }
            ResponseOutcome::AlreadyDeclined => "No further action is needed.",
            ResponseOutcome::CaseAlreadyAssigned => {
                "Thank you for responding. We will keep sending you new cases."
            }
            ResponseOutcome::InvalidLink => {
                "The link may be incomplete. Please use the buttons in the original email."
            }
        }
    }
}

impl fmt::Display for ResponseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
