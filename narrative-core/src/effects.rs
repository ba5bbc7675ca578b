//! Applying storylet choices to the stores.
//!
//! Picking a choice runs its effects in order against the narrative and core
//! game stores, completes the storylet, and activates whatever the choice
//! leads to. Minigame effects cannot resolve immediately; they are handed
//! back as [`MinigameLaunch`]es and applied later with [`resolve_minigame`].

use crate::flags::{FlagNamespace, FlagValue};
use crate::ids::StoryletId;
use crate::stores::{CoreGameStore, NarrativeStore};
use crate::storylet::{Effect, Storylet};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from resolving a choice.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    #[error("Storylet '{storylet}' has no choice '{choice}'")]
    UnknownChoice { storylet: StoryletId, choice: String },
}

/// A record of one effect taking hold.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedEffect {
    ResourceChanged {
        key: String,
        delta: f64,
        new_amount: f64,
    },
    FlagSet {
        key: String,
        value: FlagValue,
    },
    SkillXpGranted {
        key: String,
        amount: u64,
        new_total: u64,
    },
    StoryletUnlocked {
        storylet_id: StoryletId,
        /// `false` if the storylet was already active.
        newly_active: bool,
    },
    MinigameQueued {
        game_id: String,
    },
}

/// A minigame waiting to be played.
#[derive(Debug, Clone, PartialEq)]
pub struct MinigameLaunch {
    /// The storylet whose choice launched the game.
    pub storylet_id: StoryletId,
    pub game_id: String,
    pub on_success: Vec<Effect>,
    pub on_failure: Vec<Effect>,
}

/// Everything that happened when a choice (or minigame) resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChoiceOutcome {
    pub applied: Vec<AppliedEffect>,
    pub minigames: Vec<MinigameLaunch>,
    /// The storylet the choice branched to, now active.
    pub next_storylet: Option<StoryletId>,
}

/// Resolve the player's pick of `choice_id` in `storylet`.
pub fn resolve_choice(
    storylet: &Storylet,
    choice_id: &str,
    narrative: &mut NarrativeStore,
    core: &mut CoreGameStore,
) -> Result<ChoiceOutcome, EffectError> {
    let choice = storylet
        .choice(choice_id)
        .ok_or_else(|| EffectError::UnknownChoice {
            storylet: storylet.id.clone(),
            choice: choice_id.to_string(),
        })?;

    let mut outcome = ChoiceOutcome::default();
    apply_effects(&choice.effects, &storylet.id, narrative, core, &mut outcome);

    narrative.complete_storylet(storylet.id.clone());
    if let Some(next) = &choice.next_storylet_id {
        narrative.add_active(next.clone());
        outcome.next_storylet = Some(next.clone());
    }

    info!(
        storylet = %storylet.id,
        choice = choice_id,
        effects = outcome.applied.len(),
        "Resolved storylet choice"
    );
    Ok(outcome)
}

/// Apply the success or failure branch of a finished minigame.
pub fn resolve_minigame(
    launch: &MinigameLaunch,
    succeeded: bool,
    narrative: &mut NarrativeStore,
    core: &mut CoreGameStore,
) -> ChoiceOutcome {
    let effects = if succeeded {
        &launch.on_success
    } else {
        &launch.on_failure
    };
    let mut outcome = ChoiceOutcome::default();
    apply_effects(effects, &launch.storylet_id, narrative, core, &mut outcome);
    debug!(game = %launch.game_id, succeeded, "Resolved minigame");
    outcome
}

/// Apply effects in order.
pub fn apply_effects(
    effects: &[Effect],
    source: &StoryletId,
    narrative: &mut NarrativeStore,
    core: &mut CoreGameStore,
    outcome: &mut ChoiceOutcome,
) {
    for effect in effects {
        apply_effect(effect, source, narrative, core, outcome);
    }
}

/// Apply a single effect.
pub fn apply_effect(
    effect: &Effect,
    source: &StoryletId,
    narrative: &mut NarrativeStore,
    core: &mut CoreGameStore,
    outcome: &mut ChoiceOutcome,
) {
    let applied = match effect {
        Effect::Resource { key, delta } => AppliedEffect::ResourceChanged {
            key: key.clone(),
            delta: *delta,
            new_amount: core.apply_resource_delta(key.clone(), *delta),
        },
        Effect::Flag { key, value } => {
            narrative.set_flag(FlagNamespace::Storylet, key.clone(), value.clone());
            AppliedEffect::FlagSet {
                key: key.clone(),
                value: value.clone(),
            }
        }
        Effect::SkillXp { key, amount } => AppliedEffect::SkillXpGranted {
            key: key.clone(),
            amount: *amount,
            new_total: core.grant_skill_xp(key.clone(), *amount),
        },
        Effect::Unlock { storylet_id } => AppliedEffect::StoryletUnlocked {
            storylet_id: storylet_id.clone(),
            newly_active: narrative.add_active(storylet_id.clone()),
        },
        Effect::Minigame {
            game_id,
            on_success,
            on_failure,
        } => {
            outcome.minigames.push(MinigameLaunch {
                storylet_id: source.clone(),
                game_id: game_id.clone(),
                on_success: on_success.clone(),
                on_failure: on_failure.clone(),
            });
            AppliedEffect::MinigameQueued {
                game_id: game_id.clone(),
            }
        }
    };
    outcome.applied.push(applied);
}
