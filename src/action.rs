//! Built-in action table and its registry.
//!
//! The 18 actions are a closed set: [`ActionId`] enumerates them and every
//! effect computation matches on typed fields of [`Action`], never on the
//! string id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, ValidationError};

/// Identifier of one of the built-in actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionId {
    Dropoff,
    Pickup,
    Consume,
    Use,
    Work,
    Cite,
    Produce,
    Accept,
    Modify,
    Pass,
    Fail,
    DeliverService,
    TransferAllRights,
    TransferCustody,
    Transfer,
    Move,
    Raise,
    Lower,
}

impl ActionId {
    /// The wire id, e.g. `"transfer-all-rights"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dropoff => "dropoff",
            Self::Pickup => "pickup",
            Self::Consume => "consume",
            Self::Use => "use",
            Self::Work => "work",
            Self::Cite => "cite",
            Self::Produce => "produce",
            Self::Accept => "accept",
            Self::Modify => "modify",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::DeliverService => "deliver-service",
            Self::TransferAllRights => "transfer-all-rights",
            Self::TransferCustody => "transfer-custody",
            Self::Transfer => "transfer",
            Self::Move => "move",
            Self::Raise => "raise",
            Self::Lower => "lower",
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ACTIONS
            .iter()
            .map(|a| a.id)
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownAction(s.to_string()))
    }
}

/// How an action changes a quantity on the resource it names as source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Effect {
    Increment,
    Decrement,
    NoEffect,
}

impl Effect {
    /// `+1`, `-1` or `0`.
    pub fn sign(self) -> f64 {
        match self {
            Self::Increment => 1.0,
            Self::Decrement => -1.0,
            Self::NoEffect => 0.0,
        }
    }
}

/// Whether an action consumes into or produces out of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputOutput {
    Input,
    Output,
    NotApplicable,
}

/// One row of the action table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: ActionId,
    pub label: &'static str,
    /// Effect on `accountingQuantity`.
    pub resource_effect: Effect,
    /// Effect on `onhandQuantity`.
    pub onhand_effect: Effect,
    pub input_output: InputOutput,
    /// Side of the complementary action.
    pub pairs_with: InputOutput,
    /// The complementary action itself, where one exists.
    #[serde(skip)]
    pub paired_action: Option<ActionId>,
}

impl Action {
    /// Transfers and moves act on a source and a destination resource.
    pub fn is_dual_resource(&self) -> bool {
        matches!(
            self.id,
            ActionId::TransferAllRights
                | ActionId::TransferCustody
                | ActionId::Transfer
                | ActionId::Move
        )
    }

    /// Actions whose `atLocation` becomes the resource's current location.
    pub fn changes_location(&self) -> bool {
        matches!(
            self.id,
            ActionId::TransferCustody | ActionId::Transfer | ActionId::Move
        )
    }

    /// `true` if either quantity is affected.
    pub fn affects_quantity(&self) -> bool {
        self.resource_effect != Effect::NoEffect || self.onhand_effect != Effect::NoEffect
    }

    /// `pass` and `fail` set the resource state.
    pub fn is_state_outcome(&self) -> bool {
        matches!(self.id, ActionId::Pass | ActionId::Fail)
    }
}

const fn row(
    id: ActionId,
    label: &'static str,
    resource_effect: Effect,
    onhand_effect: Effect,
    input_output: InputOutput,
    pairs_with: InputOutput,
    paired_action: Option<ActionId>,
) -> Action {
    Action {
        id,
        label,
        resource_effect,
        onhand_effect,
        input_output,
        pairs_with,
        paired_action,
    }
}

use Effect::{Decrement as Dec, Increment as Inc, NoEffect as Nil};
use InputOutput::{Input, NotApplicable as Na, Output};

static ACTIONS: [Action; 18] = [
    row(ActionId::Dropoff, "dropoff", Inc, Inc, Output, Input, Some(ActionId::Pickup)),
    row(ActionId::Pickup, "pickup", Dec, Dec, Input, Output, Some(ActionId::Dropoff)),
    row(ActionId::Consume, "consume", Dec, Dec, Input, Na, None),
    row(ActionId::Use, "use", Nil, Nil, Input, Na, None),
    row(ActionId::Work, "work", Nil, Nil, Input, Na, None),
    row(ActionId::Cite, "cite", Nil, Nil, Input, Na, None),
    row(ActionId::Produce, "produce", Inc, Inc, Output, Na, None),
    row(ActionId::Accept, "accept", Nil, Dec, Input, Output, Some(ActionId::Modify)),
    row(ActionId::Modify, "modify", Nil, Inc, Output, Input, Some(ActionId::Accept)),
    row(ActionId::Pass, "pass", Nil, Nil, Output, Input, Some(ActionId::Accept)),
    row(ActionId::Fail, "fail", Nil, Nil, Output, Input, Some(ActionId::Accept)),
    row(ActionId::DeliverService, "deliver-service", Nil, Nil, Output, Na, None),
    row(ActionId::TransferAllRights, "transfer-all-rights", Dec, Nil, Na, Na, None),
    row(ActionId::TransferCustody, "transfer-custody", Nil, Dec, Na, Na, None),
    row(ActionId::Transfer, "transfer", Dec, Dec, Na, Na, None),
    row(ActionId::Move, "move", Dec, Dec, Na, Na, None),
    row(ActionId::Raise, "raise", Inc, Inc, Na, Na, None),
    row(ActionId::Lower, "lower", Dec, Dec, Na, Na, None),
];

/// Read-only view over the built-in action table.
///
/// Seeded at compile time; there is no way to add or change an action.
///
/// # Examples
///
/// ```
/// use rea_ledger::{ActionRegistry, Effect};
///
/// let raise = ActionRegistry::lookup("raise").unwrap();
/// assert_eq!(raise.resource_effect, Effect::Increment);
/// assert_eq!(ActionRegistry::list().len(), 18);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionRegistry;

impl ActionRegistry {
    /// Look up an action by its wire id.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if `id` is not a built-in action.
    pub fn lookup(id: &str) -> Result<&'static Action, LedgerError> {
        ACTIONS
            .iter()
            .find(|a| a.id.as_str() == id)
            .ok_or_else(|| LedgerError::not_found("action", id))
    }

    /// Typed lookup; infallible because the table is exhaustive.
    pub fn get(id: ActionId) -> &'static Action {
        // Table order matches declaration order of `ActionId`.
        &ACTIONS[id as usize]
    }

    /// All actions in stable table order.
    pub fn list() -> &'static [Action] {
        &ACTIONS
    }
}
